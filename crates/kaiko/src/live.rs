use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RecorderConfig,
    convention::IndexConvention,
    dash::{ManifestSnapshot, ManifestSource, Representation},
    error::KaikoResult,
    fetch::FetchQueue,
    ledger::{SegmentLedger, SegmentRef, SegmentState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEnd {
    /// Every representation went quiet for longer than the end timeout.
    Timeout,
    BroadcastEnded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveReport {
    pub polls: u64,
    pub discovered: u64,
    pub end: LiveEnd,
}

struct TrackedRepresentation {
    representation: Arc<Representation>,
    convention: Arc<dyn IndexConvention>,
    /// Live edge, only ever moves forward.
    last_seen: Option<u64>,
    last_new_at: Instant,
    ended: bool,
}

/// Follows the live edge by refreshing the manifest.
pub struct LiveSegmentPoller<M> {
    source: Arc<M>,
    ledger: Arc<SegmentLedger>,
    tracks: BTreeMap<String, TrackedRepresentation>,
    poll_interval: Duration,
    end_timeout: Duration,
    token: CancellationToken,
}

impl<M> LiveSegmentPoller<M>
where
    M: ManifestSource,
{
    pub fn new(
        source: Arc<M>,
        ledger: Arc<SegmentLedger>,
        config: &RecorderConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            ledger,
            tracks: BTreeMap::new(),
            poll_interval: config.poll_interval,
            end_timeout: config.live_end_timeout,
            token,
        }
    }

    pub fn track(&mut self, representation: Arc<Representation>, convention: Arc<dyn IndexConvention>) {
        self.tracks.insert(
            representation.id.clone(),
            TrackedRepresentation {
                representation,
                convention,
                last_seen: None,
                last_new_at: Instant::now(),
                ended: false,
            },
        );
    }

    /// Registers the window of the manifest the run started from.
    pub fn seed(&mut self, snapshot: &ManifestSnapshot, queue: &FetchQueue) -> KaikoResult<u64> {
        let discovered = self.ingest(snapshot, queue)?;
        if snapshot.ended {
            self.end_all();
        }
        Ok(discovered)
    }

    fn end_all(&mut self) {
        for tracked in self.tracks.values_mut() {
            tracked.ended = true;
        }
    }

    fn ingest(&mut self, snapshot: &ManifestSnapshot, queue: &FetchQueue) -> KaikoResult<u64> {
        let now = Instant::now();
        let mut discovered = 0;

        for (id, tracked) in self.tracks.iter_mut() {
            let Some(advertised) = snapshot.representation(id) else {
                continue;
            };

            let mut indices: Vec<u64> = advertised
                .segments
                .iter()
                .map(|s| tracked.convention.index_of(s))
                .filter(|index| tracked.last_seen.map_or(true, |last| *index > last))
                .collect();
            if indices.is_empty() {
                continue;
            }
            indices.sort_unstable();
            indices.dedup();

            // the window slid further than one refresh
            if let Some(last) = tracked.last_seen {
                let skipped: Vec<u64> = if tracked.convention.is_contiguous() {
                    (last + 1..indices[0]).collect()
                } else {
                    tracked
                        .convention
                        .stride(&tracked.representation)
                        .map(|stride| stride.skipped(last, indices[0]))
                        .unwrap_or_default()
                };
                if !skipped.is_empty() {
                    tracing::warn!(
                        "Live window of {id} skipped {} segment(s) between refreshes.",
                        skipped.len()
                    );
                    indices.splice(0..0, skipped);
                }
            }

            for index in indices {
                let url = tracked
                    .representation
                    .segment_url(tracked.convention.as_ref(), index)?;
                let segment = SegmentRef::new(id, index, url);
                if self.ledger.record(&segment, SegmentState::Discovered) {
                    queue.push(segment);
                    discovered += 1;
                }
                tracked.last_seen = Some(index);
            }
            tracked.last_new_at = now;
        }

        if discovered > 0 {
            tracing::info!("{discovered} new segments were added to queue.");
        }
        Ok(discovered)
    }

    pub async fn run(mut self, queue: FetchQueue) -> LiveReport {
        let mut report = LiveReport {
            polls: 0,
            discovered: 0,
            end: LiveEnd::Timeout,
        };
        if self.tracks.values().all(|t| t.ended) {
            report.end = LiveEnd::BroadcastEnded;
            return report;
        }

        let started_at = Instant::now();
        for tracked in self.tracks.values_mut() {
            tracked.last_new_at = started_at;
        }

        let mut next_poll = started_at + self.poll_interval;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    report.end = LiveEnd::Cancelled;
                    break;
                }
                _ = tokio::time::sleep_until(next_poll) => {}
            }

            let before_load = Instant::now();
            let fetched = tokio::select! {
                _ = self.token.cancelled() => {
                    report.end = LiveEnd::Cancelled;
                    break;
                }
                fetched = self.source.fetch() => fetched,
            };
            report.polls += 1;

            match fetched {
                Ok(snapshot) => {
                    match self.ingest(&snapshot, &queue) {
                        Ok(discovered) => report.discovered += discovered,
                        Err(e) => tracing::warn!("Failed to read live window: {e}"),
                    }
                    if snapshot.ended {
                        tracing::info!("Broadcast has ended.");
                        self.end_all();
                        report.end = LiveEnd::BroadcastEnded;
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to refresh manifest, keep polling: {e}"),
            }

            let now = Instant::now();
            for (id, tracked) in self.tracks.iter_mut().filter(|(_, t)| !t.ended) {
                if now.duration_since(tracked.last_new_at) >= self.end_timeout {
                    tracing::info!(
                        "No new segment of {id} for {:?}, end of stream.",
                        self.end_timeout
                    );
                    tracked.ended = true;
                }
            }
            if self.tracks.values().all(|t| t.ended) {
                break;
            }

            // stop polling once nobody consumes the segments
            if queue.is_closed() {
                report.end = LiveEnd::Cancelled;
                break;
            }

            next_poll = before_load + self.poll_interval;
        }

        tracing::info!(
            "Live acquisition ended ({:?}) after {} poll(s), {} segment(s) discovered.",
            report.end,
            report.polls,
            report.discovered
        );
        report
    }
}
