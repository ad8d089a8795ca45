use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RecorderConfig,
    convention::IndexConvention,
    dash::{ManifestSnapshot, ManifestSource, Representation, TrackKind},
    error::{KaikoError, KaikoResult},
    fetch::{FetchQueue, SegmentFetcher},
    ledger::{DiscoveryWindow, MergeTrack, SegmentLedger},
    live::{LiveReport, LiveSegmentPoller},
    locator::{LocatorReport, PastSegmentLocator, SearchConfig},
    probe::ExistenceProbe,
    storage::SegmentStorage,
    summary::Summary,
    util::http::SegmentSource,
};

/// ```text
/// Initializing ──► PastDiscovery ──► LiveAcquisition ──► Draining ──► Finalized
///      │                 │                  │                │
///      └─────────────────┴──────────────────┴────────────────┴──► Aborted (fatal error)
/// ```
///
/// Cancellation is not an error: from any state it drains and finalizes what the ledger holds.
///
/// The live poller starts during `Initializing` and runs alongside past discovery, so the
/// manifest's window never slides past segments nobody looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Initializing,
    PastDiscovery,
    LiveAcquisition,
    Draining,
    Finalized,
    Aborted,
}

/// Outcome of a finished run, handed to the merge step.
#[derive(Debug, Clone)]
pub struct Recording {
    pub summary: Summary,
    /// Video first, then audio.
    pub tracks: Vec<MergeTrack>,
    pub storage: SegmentStorage,
    pub cancelled: bool,
    pub past: Vec<LocatorReport>,
    pub live: Option<LiveReport>,
}

impl Recording {
    pub fn track(&self, kind: TrackKind) -> Option<&MergeTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

struct SelectedTrack {
    representation: Arc<Representation>,
    convention: Arc<dyn IndexConvention>,
    window: DiscoveryWindow,
}

pub struct Recorder<M, P, S> {
    manifest: Arc<M>,
    probe: Arc<P>,
    source: S,
    storage: SegmentStorage,
    config: RecorderConfig,
    ledger: Arc<SegmentLedger>,
    state: Mutex<RecorderState>,
    token: CancellationToken,
}

impl<M, P, S> Recorder<M, P, S>
where
    M: ManifestSource,
    P: ExistenceProbe,
    S: SegmentSource + Clone,
{
    pub fn new(
        manifest: M,
        probe: P,
        source: S,
        storage: SegmentStorage,
        config: RecorderConfig,
    ) -> Self {
        Self {
            manifest: Arc::new(manifest),
            probe: Arc::new(probe),
            source,
            storage,
            config,
            ledger: Arc::new(SegmentLedger::new()),
            state: Mutex::new(RecorderState::Initializing),
            token: CancellationToken::new(),
        }
    }

    /// Cancelling `token` drains what has been discovered and finalizes the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    pub fn ledger(&self) -> Arc<SegmentLedger> {
        self.ledger.clone()
    }

    fn transition(&self, state: RecorderState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Recorder state: {:?} -> {state:?}", *current);
            *current = state;
        }
    }

    pub async fn run(&self) -> KaikoResult<Recording> {
        match self.record().await {
            Ok(recording) => {
                self.transition(RecorderState::Finalized);
                Ok(recording)
            }
            Err(e) => {
                tracing::error!("Recording aborted: {e}");
                self.transition(RecorderState::Aborted);
                Err(e)
            }
        }
    }

    async fn record(&self) -> KaikoResult<Recording> {
        self.transition(RecorderState::Initializing);

        let fetched = tokio::select! {
            _ = self.token.cancelled() => Err(KaikoError::Cancelled),
            fetched = self.manifest.fetch() => fetched,
        };
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(KaikoError::Cancelled) => return Ok(self.startup_cancelled()),
            Err(e) => return Err(e),
        };
        let tracks = self.select_tracks(&snapshot)?;

        let fetcher = SegmentFetcher::new(
            self.source.clone(),
            self.ledger.clone(),
            self.storage.clone(),
            &self.config,
            self.token.clone(),
        );
        let mut poller = LiveSegmentPoller::new(
            self.manifest.clone(),
            self.ledger.clone(),
            &self.config,
            self.token.clone(),
        );

        for track in &tracks {
            let representation = &track.representation;
            self.ledger
                .register(representation.clone(), track.convention.clone());
            self.storage.prepare(&representation.id).await?;
            match fetcher.download_init(representation).await {
                Ok(_) => {}
                Err(KaikoError::Cancelled) => return Ok(self.startup_cancelled()),
                Err(e) => return Err(e),
            }
            poller.track(representation.clone(), track.convention.clone());
        }

        let handle = fetcher.start();
        let live_queue = handle.live_queue();
        if let Err(e) = poller.seed(&snapshot, &live_queue) {
            drop(live_queue);
            handle.finish().await;
            return Err(e);
        }
        let poller = tokio::spawn(poller.run(live_queue));

        self.transition(RecorderState::PastDiscovery);
        let past = if self.config.past_enabled {
            self.discover_past(&tracks, snapshot.publish_frame_time, handle.past_queue())
                .await
        } else {
            tracing::info!("Past acquisition disabled, recording from the live edge.");
            Ok(Vec::new())
        };
        let past = match past {
            Ok(past) => past,
            Err(e) => {
                self.token.cancel();
                _ = poller.await;
                handle.finish().await;
                return Err(e);
            }
        };

        self.transition(RecorderState::LiveAcquisition);
        let live = match poller.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("Live poller failed: {e}");
                None
            }
        };

        self.transition(RecorderState::Draining);
        let fetched = handle.finish().await;
        let settled = self.ledger.settle_pending();
        if settled > 0 {
            tracing::warn!("{settled} segment(s) never finished and are recorded as missing.");
        }
        tracing::info!(
            "Recording finished: {} downloaded, {} missing.",
            fetched.downloaded,
            fetched.missing + settled
        );

        Ok(self.finalize(past, live))
    }

    /// Nothing was queued yet, so there is nothing to drain either.
    fn startup_cancelled(&self) -> Recording {
        tracing::info!("Cancelled while starting up, nothing was recorded.");
        self.transition(RecorderState::Draining);
        self.finalize(Vec::new(), None)
    }

    fn finalize(&self, past: Vec<LocatorReport>, live: Option<LiveReport>) -> Recording {
        let mut tracks = self.ledger.tracks();
        tracks.sort_by_key(|t| t.kind());

        Recording {
            summary: self.ledger.snapshot(),
            tracks,
            storage: self.storage.clone(),
            cancelled: self.token.is_cancelled(),
            past,
            live,
        }
    }

    fn select_tracks(&self, snapshot: &ManifestSnapshot) -> KaikoResult<Vec<SelectedTrack>> {
        let video = snapshot
            .select(TrackKind::Video, &self.config.video_preference)
            .ok_or(KaikoError::NoRepresentationFound(TrackKind::Video))?;
        let audio = snapshot.select(TrackKind::Audio, &self.config.audio_preference);
        if audio.is_none() {
            tracing::warn!("No audio representation found, recording video only.");
        }

        [Some(video), audio]
            .into_iter()
            .flatten()
            .map(|advertised| {
                let representation = advertised.representation.clone();
                let convention = self.config.convention.resolve(&representation.media);

                let indices = advertised.segments.iter().map(|s| convention.index_of(s));
                let (Some(oldest), Some(newest)) = (indices.clone().min(), indices.max()) else {
                    return Err(KaikoError::MpdParsing(format!(
                        "representation {} advertises no segment",
                        representation.id
                    )));
                };

                tracing::info!(
                    "Tracking {} {} with {} convention, live window [{oldest}, {newest}].",
                    representation.kind,
                    representation.id,
                    convention.name()
                );
                Ok(SelectedTrack {
                    representation,
                    convention,
                    window: DiscoveryWindow::new(oldest, newest),
                })
            })
            .collect()
    }

    async fn discover_past(
        &self,
        tracks: &[SelectedTrack],
        publish_frame_time: Option<u64>,
        queue: FetchQueue,
    ) -> KaikoResult<Vec<LocatorReport>> {
        let permits = Arc::new(Semaphore::new(self.config.max_search_requests.get()));
        let search = SearchConfig::from(&self.config);

        let locators = tracks.iter().map(|track| {
            PastSegmentLocator::new(
                self.probe.clone(),
                self.ledger.clone(),
                track.representation.clone(),
                track.convention.clone(),
                track.window,
                search.clone(),
                permits.clone(),
                self.token.clone(),
            )
            .with_publish_frame_time(publish_frame_time)
            .run(&queue)
        });

        join_all(locators).await.into_iter().collect()
    }
}

/// First ctrl-c finishes the run with what has been recorded, the second one exits.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        // wait for the first ctrl-c to stop recording
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("Ctrl-C received, finishing with what has been recorded.");
        token.cancel();

        // wait for the second ctrl-c to force exit
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received again, force exit.");
            std::process::exit(1);
        }
    })
}
