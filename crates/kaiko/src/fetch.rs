use std::{
    num::NonZeroU32,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RecorderConfig,
    dash::Representation,
    error::{KaikoError, KaikoResult},
    ledger::{SegmentLedger, SegmentRef, SegmentState},
    storage::SegmentStorage,
    util::{http::SegmentSource, retry::RetryPolicy},
};

/// Downloads segments with a global concurrency limit, recording every outcome in the ledger.
pub struct SegmentFetcher<S> {
    source: Arc<S>,
    ledger: Arc<SegmentLedger>,
    storage: SegmentStorage,
    retry: RetryPolicy,
    concurrency: NonZeroU32,
    permits: Arc<Semaphore>,
    past_delay: Duration,
    token: CancellationToken,

    total: Arc<AtomicUsize>,
    downloaded: Arc<AtomicUsize>,
    missing: Arc<AtomicUsize>,
}

// Derived Clone would require `S: Clone`.
impl<S> Clone for SegmentFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            ledger: self.ledger.clone(),
            storage: self.storage.clone(),
            retry: self.retry.clone(),
            concurrency: self.concurrency,
            permits: self.permits.clone(),
            past_delay: self.past_delay,
            token: self.token.clone(),
            total: self.total.clone(),
            downloaded: self.downloaded.clone(),
            missing: self.missing.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub downloaded: usize,
    pub missing: usize,
}

/// Sending half of one of the fetcher's queues.
#[derive(Clone)]
pub struct FetchQueue {
    sender: mpsc::UnboundedSender<SegmentRef>,
    total: Arc<AtomicUsize>,
}

impl FetchQueue {
    /// A queue not attached to any fetcher, whose segments are read from the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SegmentRef>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            total: Arc::new(AtomicUsize::new(0)),
        };
        (queue, receiver)
    }

    /// Returns `false` once the fetcher stopped accepting work.
    pub fn push(&self, segment: SegmentRef) -> bool {
        if self.sender.send(segment).is_err() {
            return false;
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct FetchHandle {
    past: FetchQueue,
    live: FetchQueue,
    task: JoinHandle<FetchReport>,
}

impl FetchHandle {
    /// Queue paced by the past segment delay.
    pub fn past_queue(&self) -> FetchQueue {
        self.past.clone()
    }

    /// Unpaced queue, so live acquisition never waits behind the past backlog.
    pub fn live_queue(&self) -> FetchQueue {
        self.live.clone()
    }

    /// Closes both queues and waits until every queued segment reached a terminal state.
    ///
    /// Clones handed out by [FetchHandle::past_queue] and [FetchHandle::live_queue]
    /// must be dropped as well, or this never returns.
    pub async fn finish(self) -> FetchReport {
        let Self { past, live, task } = self;
        drop(past);
        drop(live);

        match task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Fetcher task failed: {e}");
                FetchReport::default()
            }
        }
    }
}

impl<S> SegmentFetcher<S>
where
    S: SegmentSource,
{
    pub fn new(
        source: S,
        ledger: Arc<SegmentLedger>,
        storage: SegmentStorage,
        config: &RecorderConfig,
        token: CancellationToken,
    ) -> Self {
        let concurrency = config.download_concurrency;
        Self {
            source: Arc::new(source),
            ledger,
            storage,
            retry: RetryPolicy::new(
                config.download_retries,
                config.download_retry_delay,
                config.download_retry_max_delay,
            )
            .with_jitter(true),
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency.get() as usize)),
            past_delay: config.past_segment_delay,
            token,

            total: Arc::new(AtomicUsize::new(0)),
            downloaded: Arc::new(AtomicUsize::new(0)),
            missing: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Downloads the initialization segment of `representation`, if it has one.
    ///
    /// Without it no media segment of the track can be decoded, so failure is fatal.
    pub async fn download_init(
        &self,
        representation: &Representation,
    ) -> KaikoResult<Option<PathBuf>> {
        let Some(url) = representation.init_url()? else {
            return Ok(None);
        };

        let path = self.storage.init_path(&representation.id);
        if !SegmentStorage::is_complete(&path) {
            let source = &self.source;
            let (url, target) = (&url, &path);
            let result = self
                .retry
                .run(&self.token, move |_| async move {
                    let bytes = source.fetch_segment(url).await?;
                    SegmentStorage::write_atomic(target, &bytes).await
                })
                .await;

            match result {
                Ok(()) => {}
                Err(KaikoError::Cancelled) => return Err(KaikoError::Cancelled),
                Err(e) => {
                    return Err(KaikoError::InitSegmentUnavailable(format!(
                        "{} ({url}): {e}",
                        representation.id
                    )))
                }
            }
        }

        tracing::info!(
            "Initialization segment of {} saved to {}",
            representation.id,
            path.display()
        );
        self.ledger.set_init_segment(&representation.id, path.clone());
        Ok(Some(path))
    }

    /// Downloads one segment and returns the terminal state it ended in.
    pub async fn download(&self, segment: SegmentRef) -> SegmentState {
        let path = self
            .storage
            .segment_path(&segment.representation, segment.index);

        if SegmentStorage::is_complete(&path) {
            tracing::debug!("File {} already exists, ignoring.", path.display());
            let state = if self
                .ledger
                .record(&segment.clone().with_path(path), SegmentState::Downloaded)
            {
                SegmentState::Downloaded
            } else {
                self.ledger.state(&segment.representation, segment.index)
            };
            self.report(&segment, state);
            return state;
        }

        if !self.ledger.record(&segment, SegmentState::Downloading) {
            // already taken care of by another task
            return self.ledger.state(&segment.representation, segment.index);
        }

        let (source, ledger) = (&self.source, &self.ledger);
        let (target, pending) = (&path, &segment);
        let result = self
            .retry
            .run(&self.token, move |attempt| async move {
                let outcome = async {
                    let bytes = source.fetch_segment(&pending.url).await?;
                    SegmentStorage::write_atomic(target, &bytes).await
                }
                .await;

                if let Err(e) = &outcome {
                    tracing::warn!(
                        representation = %pending.representation,
                        index = pending.index,
                        attempt = attempt + 1,
                        "Processing segment failed. {e}"
                    );
                    ledger.record(pending, SegmentState::Failed);
                }
                outcome
            })
            .await;

        let state = match result {
            Ok(()) => {
                self.ledger
                    .record(&segment.clone().with_path(path), SegmentState::Downloaded);
                SegmentState::Downloaded
            }
            Err(e) => {
                if matches!(e, KaikoError::Cancelled) {
                    tracing::debug!("Download of {} cancelled.", segment.url);
                } else {
                    tracing::error!(
                        "Processing {} #{} failed, max retries exceed, drop. {e}",
                        segment.representation,
                        segment.index
                    );
                }
                self.ledger.record(&segment, SegmentState::Missing);
                SegmentState::Missing
            }
        };

        self.report(&segment, state);
        state
    }

    fn report(&self, segment: &SegmentRef, state: SegmentState) {
        match state {
            SegmentState::Downloaded => self.downloaded.fetch_add(1, Ordering::Relaxed),
            SegmentState::Missing => self.missing.fetch_add(1, Ordering::Relaxed),
            _ => return,
        };

        let finished =
            self.downloaded.load(Ordering::Relaxed) + self.missing.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed).max(finished);
        let percentage = if total == 0 {
            0.
        } else {
            finished as f32 / total as f32 * 100.
        };
        tracing::info!(
            "Processing {} #{} finished. ({finished} / {total} or {percentage:.2}%)",
            segment.representation,
            segment.index
        );
    }

    fn abandon(&self, segment: SegmentRef) {
        if self.ledger.record(&segment, SegmentState::Missing) {
            self.missing.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Starts the past and live dispatchers.
    pub fn start(&self) -> FetchHandle {
        let (past_sender, past_receiver) = mpsc::unbounded_channel();
        let (live_sender, live_receiver) = mpsc::unbounded_channel();

        let fetcher = self.clone();
        let task = tokio::spawn(async move {
            tracing::info!(
                "Start downloading with {} thread(s).",
                fetcher.concurrency.get()
            );

            tokio::join!(
                fetcher
                    .clone()
                    .dispatch(past_receiver, Some(fetcher.past_delay)),
                fetcher.clone().dispatch(live_receiver, None),
            );

            // wait for all tasks to finish
            _ = fetcher.permits.acquire_many(fetcher.concurrency.get()).await;

            FetchReport {
                downloaded: fetcher.downloaded.load(Ordering::Relaxed),
                missing: fetcher.missing.load(Ordering::Relaxed),
            }
        });

        FetchHandle {
            past: FetchQueue {
                sender: past_sender,
                total: self.total.clone(),
            },
            live: FetchQueue {
                sender: live_sender,
                total: self.total.clone(),
            },
            task,
        }
    }

    async fn dispatch(
        self,
        mut receiver: mpsc::UnboundedReceiver<SegmentRef>,
        pacing: Option<Duration>,
    ) {
        let pacing = pacing.filter(|delay| !delay.is_zero());
        let mut next_start = Instant::now();

        while let Some(segment) = receiver.recv().await {
            if self.token.is_cancelled() {
                self.abandon(segment);
                continue;
            }

            if let Some(delay) = pacing {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        self.abandon(segment);
                        continue;
                    }
                    _ = tokio::time::sleep_until(next_start) => {}
                }
                next_start = Instant::now() + delay;
            }

            let permit = tokio::select! {
                _ = self.token.cancelled() => {
                    self.abandon(segment);
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fetcher = self.clone();
            tokio::spawn(async move {
                fetcher.download(segment).await;

                // drop permit to release the semaphore
                drop(permit);
            });
        }
    }
}
