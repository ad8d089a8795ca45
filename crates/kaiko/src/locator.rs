//! Rediscovers segments older than the manifest's live window.
//!
//! ```text
//!            backward walk                        live window
//!   0 <─── [chunk n] ... [chunk 2] [chunk 1] ──── [oldest .. newest]
//!
//!   each chunk is probed concurrently, then read in walk order:
//!
//!   present  present  absent absent  present  absent absent absent ... (threshold)
//!      │        │       └─ gap ─┘       │       └────── terminating run ──────┘
//!      ▼        ▼       (missing)       ▼
//!   queued   queued                  queued
//! ```
//!
//! Time addressed representations leave most indices unused. Once a segment is found,
//! the walk jumps by the nominal segment duration and only probes a tolerance window
//! around where the next one should start. A gap between two found segments that is
//! longer than one segment is recorded as missing segments at their expected times.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RecorderConfig,
    convention::{IndexConvention, SearchDirection, Stride},
    dash::Representation,
    error::KaikoResult,
    fetch::FetchQueue,
    ledger::{DiscoveryWindow, SegmentLedger, SegmentRef, SegmentState},
    probe::{check_with_retries, ExistenceProbe, ProbeOutcome},
};

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub direction: SearchDirection,
    pub chunk_size: u64,
    pub miss_threshold: u64,
    pub check_attempts: u32,
    pub check_retry_delay: Duration,
}

impl From<&RecorderConfig> for SearchConfig {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            direction: config.search_direction,
            chunk_size: config.search_chunk_size.get(),
            miss_threshold: config.end_stream_miss_threshold.get(),
            check_attempts: config.check_url_retries,
            check_retry_delay: config.check_url_retry_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEnd {
    /// Too many consecutive absent indices.
    MissThreshold,
    /// The backward walk reached the lowest possible index.
    IndexSpaceExhausted,
    /// The forward walk caught up with the live window.
    ReachedLiveWindow,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorReport {
    pub representation: String,
    pub discovered: u64,
    pub missing: u64,
    pub probed: u64,
    /// Indices that never got a definitive answer.
    pub unresolved: u64,
    /// Oldest index known to exist once the search ended.
    pub oldest: u64,
    pub end: SearchEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    Absent,
    Unresolved,
}

#[derive(Debug, Default)]
struct Walk {
    /// Last present index behind the walk. Gaps are interior once another one shows up.
    last_present: Option<u64>,
    /// Jumping from `last_present` by the nominal segment duration.
    striding: bool,
    absent_run: u64,
    pending: Vec<(SegmentRef, Gap)>,
}

enum Step {
    /// Go on walking from this index, inclusive.
    Continue(u64),
    End(SearchEnd),
}

pub struct PastSegmentLocator<P> {
    probe: Arc<P>,
    ledger: Arc<SegmentLedger>,
    representation: Arc<Representation>,
    convention: Arc<dyn IndexConvention>,
    stride: Option<Stride>,
    config: SearchConfig,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    window: DiscoveryWindow,
    /// Oldest index of the live window the search started from.
    live_oldest: u64,
    publish_frame_time: Option<u64>,
}

impl<P> PastSegmentLocator<P>
where
    P: ExistenceProbe,
{
    /// `permits` bounds probes in flight and is meant to be shared by every locator of a run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe: Arc<P>,
        ledger: Arc<SegmentLedger>,
        representation: Arc<Representation>,
        convention: Arc<dyn IndexConvention>,
        window: DiscoveryWindow,
        config: SearchConfig,
        permits: Arc<Semaphore>,
        token: CancellationToken,
    ) -> Self {
        let stride = convention.stride(&representation);
        Self {
            probe,
            ledger,
            representation,
            convention,
            stride,
            config,
            permits,
            token,
            live_oldest: window.oldest,
            window,
            publish_frame_time: None,
        }
    }

    /// Seed of a forward search, when the manifest tells where the broadcast started.
    pub fn with_publish_frame_time(mut self, publish_frame_time: Option<u64>) -> Self {
        self.publish_frame_time = publish_frame_time;
        self
    }

    pub async fn run(mut self, queue: &FetchQueue) -> KaikoResult<LocatorReport> {
        let id = self.representation.id.clone();
        let lowest = self.convention.first_index(&self.representation);
        let live_oldest = self.live_oldest;

        // inclusive bounds of the walk, in walk order
        let (start, bound, mut walk) = match self.config.direction {
            SearchDirection::Backward => (
                live_oldest.checked_sub(1).filter(|i| *i >= lowest),
                lowest,
                Walk {
                    last_present: Some(live_oldest),
                    striding: self.stride.is_some(),
                    ..Default::default()
                },
            ),
            SearchDirection::Forward => {
                let seed = self
                    .convention
                    .forward_seed(&self.representation, self.publish_frame_time)
                    .max(lowest);
                (
                    live_oldest.checked_sub(1).filter(|last| seed <= *last).map(|_| seed),
                    live_oldest.saturating_sub(1),
                    Walk::default(),
                )
            }
        };

        let mut report = LocatorReport {
            representation: id.clone(),
            discovered: 0,
            missing: 0,
            probed: 0,
            unresolved: 0,
            oldest: live_oldest,
            end: self.exhausted(),
        };

        let Some(mut cursor) = start else {
            tracing::info!("No index left to search before the live window of {id}.");
            self.finish(&mut walk, &mut report)?;
            return Ok(report);
        };

        tracing::info!(
            "Searching past segments of {id} {} from {cursor} ({} convention).",
            self.config.direction,
            self.convention.name()
        );

        loop {
            if self.token.is_cancelled() {
                report.end = SearchEnd::Cancelled;
                break;
            }

            let step = match (self.stride, walk.last_present) {
                (Some(stride), Some(origin)) if walk.striding => {
                    self.stride_step(stride, origin, cursor, bound, &mut walk, &mut report, queue)
                        .await?
                }
                _ => {
                    self.chunk_step(cursor, bound, &mut walk, &mut report, queue)
                        .await?
                }
            };
            match step {
                Step::Continue(next) => cursor = next,
                Step::End(end) => {
                    report.end = end;
                    break;
                }
            }
        }

        self.finish(&mut walk, &mut report)?;
        Ok(report)
    }

    /// Probes the next chunk of consecutive indices.
    async fn chunk_step(
        &mut self,
        cursor: u64,
        bound: u64,
        walk: &mut Walk,
        report: &mut LocatorReport,
        queue: &FetchQueue,
    ) -> KaikoResult<Step> {
        let remaining = cursor.abs_diff(bound) + 1;
        let budget = self.config.miss_threshold - walk.absent_run;
        let len = self.config.chunk_size.min(budget).min(remaining).max(1);
        let indices: Vec<u64> = match self.config.direction {
            SearchDirection::Backward => (0..len).map(|i| cursor - i).collect(),
            SearchDirection::Forward => (0..len).map(|i| cursor + i).collect(),
        };
        tracing::debug!(
            "Searching {} in range [{}, {}]...",
            self.representation.id,
            indices[0],
            indices[indices.len() - 1]
        );

        let outcomes = self.probe_chunk(&indices).await?;
        report.probed += len;

        for (segment, outcome) in outcomes {
            match outcome {
                ProbeOutcome::Present => {
                    self.present(segment, walk, report, queue)?;
                    walk.striding = self.stride.is_some();
                }
                ProbeOutcome::Absent => {
                    if self.absent(segment, walk) {
                        return Ok(Step::End(SearchEnd::MissThreshold));
                    }
                }
                ProbeOutcome::Indeterminate => self.unresolved(segment, walk, report),
            }
        }

        Ok(self.advance(indices[indices.len() - 1], bound))
    }

    /// Probes around where the segment after `origin` should start, nearest first.
    ///
    /// An empty window means the segment is lost or shorter than expected, and the walk
    /// goes back to consecutive chunks right after the window.
    #[allow(clippy::too_many_arguments)]
    async fn stride_step(
        &mut self,
        stride: Stride,
        origin: u64,
        cursor: u64,
        bound: u64,
        walk: &mut Walk,
        report: &mut LocatorReport,
        queue: &FetchQueue,
    ) -> KaikoResult<Step> {
        let (mut candidates, resume) = self.stride_window(stride, origin, cursor, bound);
        let budget = self.config.miss_threshold - walk.absent_run;
        candidates.truncate(usize::try_from(budget).unwrap_or(usize::MAX));

        let chunk_size = usize::try_from(self.config.chunk_size)
            .unwrap_or(usize::MAX)
            .max(1);
        let (nearest, rest) = candidates.split_at(candidates.len().min(1));
        for batch in std::iter::once(nearest).chain(rest.chunks(chunk_size)) {
            if batch.is_empty() {
                continue;
            }

            let outcomes = self.probe_chunk(batch).await?;
            report.probed += batch.len() as u64;

            let mut present = Vec::new();
            for (segment, outcome) in outcomes {
                match outcome {
                    ProbeOutcome::Present => present.push(segment),
                    ProbeOutcome::Absent => {
                        self.absent(segment, walk);
                    }
                    ProbeOutcome::Indeterminate => self.unresolved(segment, walk, report),
                }
            }

            if !present.is_empty() {
                present.sort_unstable_by_key(|segment| segment.index);
                if self.config.direction == SearchDirection::Backward {
                    present.reverse();
                }
                let mut last = origin;
                for segment in present {
                    last = segment.index;
                    self.present(segment, walk, report, queue)?;
                }
                return Ok(self.advance(last, bound));
            }
            if walk.absent_run >= self.config.miss_threshold {
                return Ok(Step::End(SearchEnd::MissThreshold));
            }
        }

        tracing::debug!(
            "No segment of {} around {origin} + {} ticks, searching consecutive indices.",
            self.representation.id,
            stride.duration
        );
        walk.striding = false;
        Ok(match resume {
            Some(next) => Step::Continue(next),
            None => Step::End(self.exhausted()),
        })
    }

    /// Candidates of a stride from `origin`, nearest to the expected index first, and the
    /// index right past the window where a consecutive walk resumes.
    ///
    /// Only indices between `cursor` and `bound` are candidates: the rest were probed already.
    fn stride_window(
        &self,
        stride: Stride,
        origin: u64,
        cursor: u64,
        bound: u64,
    ) -> (Vec<u64>, Option<u64>) {
        let duration = i128::from(stride.duration);
        let tolerance = i128::from(stride.tolerance);
        let (expected, past_window, low, high) = match self.config.direction {
            SearchDirection::Backward => {
                let expected = i128::from(origin) - duration;
                (expected, expected - tolerance - 1, bound, cursor)
            }
            SearchDirection::Forward => {
                let expected = i128::from(origin) + duration;
                (expected, expected + tolerance + 1, cursor, bound)
            }
        };
        let reachable = i128::from(low)..=i128::from(high);

        let candidates = std::iter::once(0)
            .chain((1..=tolerance).flat_map(|k| [-k, k]))
            .map(|offset| expected + offset)
            .filter(|index| reachable.contains(index))
            .filter_map(|index| u64::try_from(index).ok())
            .collect();

        // never resume behind the cursor
        let resume = match self.config.direction {
            SearchDirection::Backward => past_window.min(i128::from(cursor)),
            SearchDirection::Forward => past_window.max(i128::from(cursor)),
        };
        let resume = reachable
            .contains(&resume)
            .then(|| u64::try_from(resume).ok())
            .flatten();

        (candidates, resume)
    }

    /// Next index after `index` in walk order, unless that leaves the index space.
    fn advance(&self, index: u64, bound: u64) -> Step {
        let next = match self.config.direction {
            SearchDirection::Backward => index.checked_sub(1).filter(|i| *i >= bound),
            SearchDirection::Forward => index.checked_add(1).filter(|i| *i <= bound),
        };
        match next {
            Some(next) => Step::Continue(next),
            None => Step::End(self.exhausted()),
        }
    }

    fn present(
        &mut self,
        segment: SegmentRef,
        walk: &mut Walk,
        report: &mut LocatorReport,
        queue: &FetchQueue,
    ) -> KaikoResult<()> {
        self.resolve_gaps(walk, true, report);
        if let Some(origin) = walk.last_present {
            self.mark_skipped(origin, segment.index, report)?;
        }
        walk.last_present = Some(segment.index);
        walk.absent_run = 0;
        self.window.extend_past(segment.index);

        if self.ledger.record(&segment, SegmentState::Discovered) {
            report.discovered += 1;
            queue.push(segment);
        }
        Ok(())
    }

    /// Returns whether the absent run reached the miss threshold.
    fn absent(&self, segment: SegmentRef, walk: &mut Walk) -> bool {
        self.ledger.record(&segment, SegmentState::ProbedAbsent);
        if self.convention.is_contiguous() {
            walk.pending.push((segment, Gap::Absent));
        }
        walk.absent_run += 1;
        walk.absent_run >= self.config.miss_threshold
    }

    fn unresolved(&self, segment: SegmentRef, walk: &mut Walk, report: &mut LocatorReport) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::warn!(
            "No definitive answer for {} #{} after {} attempt(s).",
            segment.representation,
            segment.index,
            self.config.check_attempts
        );
        report.unresolved += 1;
        if self.convention.is_contiguous() {
            walk.pending.push((segment, Gap::Unresolved));
        }
    }

    fn exhausted(&self) -> SearchEnd {
        match self.config.direction {
            SearchDirection::Backward => SearchEnd::IndexSpaceExhausted,
            SearchDirection::Forward => SearchEnd::ReachedLiveWindow,
        }
    }

    fn finish(&mut self, walk: &mut Walk, report: &mut LocatorReport) -> KaikoResult<()> {
        // the live window closes a forward walk, which makes its trailing gaps interior
        let interior = report.end == SearchEnd::ReachedLiveWindow;
        self.resolve_gaps(walk, interior, report);
        if interior {
            if let Some(origin) = walk.last_present {
                self.mark_skipped(origin, self.live_oldest, report)?;
            }
        }

        report.oldest = self.window.oldest;
        tracing::info!(
            "Past search of {} ended ({:?}): {} discovered, {} missing, {} probed, oldest index {}.",
            report.representation,
            report.end,
            report.discovered,
            report.missing,
            report.probed,
            report.oldest
        );
        Ok(())
    }

    /// Settles the gaps collected since the last present index of a contiguous convention.
    ///
    /// A gap is interior when present indices surround it, and its indices are then
    /// missing segments.
    fn resolve_gaps(&self, walk: &mut Walk, closed: bool, report: &mut LocatorReport) {
        let interior = closed && walk.last_present.is_some();
        for (segment, gap) in walk.pending.drain(..) {
            if !interior {
                continue;
            }
            if self.ledger.record(&segment, SegmentState::Missing) {
                tracing::warn!(
                    "Segment {} #{} is missing ({gap:?}).",
                    segment.representation,
                    segment.index
                );
                report.missing += 1;
            }
        }
    }

    /// Records the segments expected between two present indices of a sparse convention.
    fn mark_skipped(&self, from: u64, to: u64, report: &mut LocatorReport) -> KaikoResult<()> {
        let Some(stride) = self.stride else {
            return Ok(());
        };
        for index in stride.skipped(from, to) {
            let url = self
                .representation
                .segment_url(self.convention.as_ref(), index)?;
            let segment = SegmentRef::new(&self.representation.id, index, url);
            if self.ledger.record(&segment, SegmentState::Missing) {
                tracing::warn!(
                    "Segment {} expected at {index} is missing.",
                    segment.representation
                );
                report.missing += 1;
            }
        }
        Ok(())
    }

    async fn probe_chunk(&self, indices: &[u64]) -> KaikoResult<Vec<(SegmentRef, ProbeOutcome)>> {
        let segments = indices
            .iter()
            .map(|&index| {
                let url = self
                    .representation
                    .segment_url(self.convention.as_ref(), index)?;
                Ok(SegmentRef::new(&self.representation.id, index, url))
            })
            .collect::<KaikoResult<Vec<_>>>()?;

        let probes = segments.into_iter().map(|segment| async move {
            let outcome = match self.permits.acquire().await {
                Ok(_permit) if !self.token.is_cancelled() => {
                    check_with_retries(
                        self.probe.as_ref(),
                        &segment.url,
                        self.config.check_attempts,
                        self.config.check_retry_delay,
                        &self.token,
                    )
                    .await
                }
                _ => ProbeOutcome::Indeterminate,
            };
            (segment, outcome)
        });

        Ok(join_all(probes).await)
    }
}
