use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crate::{
    convention::IndexConvention,
    dash::{Representation, TrackKind},
    summary::{MissingSegment, RepresentationSummary, Summary},
    util::range::IndexRanges,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentState {
    Unknown,
    ProbedAbsent,
    Discovered,
    Downloading,
    Downloaded,
    /// At least one attempt failed. More attempts may follow.
    Failed,
    /// Known or assumed to exist, but never captured.
    Missing,
}

impl SegmentState {
    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::ProbedAbsent => 1,
            Self::Discovered => 2,
            Self::Downloading => 3,
            Self::Failed => 4,
            Self::Downloaded | Self::Missing => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Downloaded | Self::Missing)
    }

    /// States only ever move forward, and terminal states never move.
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub representation: String,
    pub index: u64,
    pub url: Url,
    pub state: SegmentState,
    /// Local file, once downloaded.
    pub path: Option<PathBuf>,
}

impl SegmentRef {
    pub fn new(representation: impl Into<String>, index: u64, url: Url) -> Self {
        Self {
            representation: representation.into(),
            index,
            url,
            state: SegmentState::Unknown,
            path: None,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }
}

/// Range of indices known to exist for one representation.
///
/// Past discovery pushes `oldest` down, live polling pushes `newest` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryWindow {
    pub oldest: u64,
    pub newest: u64,
}

impl DiscoveryWindow {
    pub fn new(oldest: u64, newest: u64) -> Self {
        Self {
            oldest: oldest.min(newest),
            newest: oldest.max(newest),
        }
    }

    pub fn extend_past(&mut self, index: u64) {
        self.oldest = self.oldest.min(index);
    }

    pub fn extend_live(&mut self, index: u64) {
        self.newest = self.newest.max(index);
    }

    pub fn contains(&self, index: u64) -> bool {
        (self.oldest..=self.newest).contains(&index)
    }
}

/// Ordered, gap-annotated handoff of one representation to the merge step.
#[derive(Debug, Clone)]
pub struct MergeTrack {
    pub representation: Arc<Representation>,
    pub init: Option<PathBuf>,
    pub entries: Vec<TrackEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEntry {
    Segment { index: u64, path: PathBuf },
    Gap { index: u64 },
}

impl MergeTrack {
    pub fn kind(&self) -> TrackKind {
        self.representation.kind
    }

    pub fn segment_paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            TrackEntry::Segment { path, .. } => Some(path.as_path()),
            TrackEntry::Gap { .. } => None,
        })
    }

    pub fn gaps(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, TrackEntry::Gap { .. }))
            .count()
    }
}

#[derive(Debug)]
struct TrackLedger {
    representation: Arc<Representation>,
    convention: Arc<dyn IndexConvention>,
    segments: BTreeMap<u64, SegmentRef>,
    absent: IndexRanges,
    init: Option<PathBuf>,
}

impl TrackLedger {
    fn state(&self, index: u64) -> SegmentState {
        match self.segments.get(&index) {
            Some(segment) => segment.state,
            None if self.absent.contains(index) => SegmentState::ProbedAbsent,
            None => SegmentState::Unknown,
        }
    }

    fn summarize(&self) -> RepresentationSummary {
        let representation = &self.representation;
        let timestamp = |index: u64| {
            self.convention
                .presentation_time(representation, index)
                .as_secs_f64()
        };

        let mut summary = RepresentationSummary::new(
            &representation.id,
            representation.kind,
            self.convention.name(),
        );
        summary.probed_absent = self.absent.len();
        summary.first_index = self.segments.keys().next().copied();
        summary.last_index = self.segments.keys().next_back().copied();

        for segment in self.segments.values() {
            match segment.state {
                SegmentState::Downloaded => summary.downloaded += 1,
                SegmentState::Failed => summary.failed += 1,
                SegmentState::Missing => {
                    summary.missing += 1;
                    summary.missing_segments.push(MissingSegment {
                        index: segment.index,
                        timestamp: timestamp(segment.index),
                    });
                }
                _ => summary.pending += 1,
            }
        }

        if let (Some(first), Some(last)) = (summary.first_index, summary.last_index) {
            let last_duration = representation.segment_duration.unwrap_or(0) as f64
                / representation.timescale.max(1) as f64;
            summary.first_timestamp = Some(timestamp(first));
            summary.estimated_duration = timestamp(last) - timestamp(first) + last_duration;
        }

        summary
    }
}

/// The single source of truth about every segment of every representation.
#[derive(Debug, Default)]
pub struct SegmentLedger {
    tracks: Mutex<BTreeMap<String, TrackLedger>>,
}

impl SegmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same representation twice keeps the existing entries.
    pub fn register(
        &self,
        representation: Arc<Representation>,
        convention: Arc<dyn IndexConvention>,
    ) {
        self.tracks
            .lock()
            .entry(representation.id.clone())
            .or_insert_with(|| TrackLedger {
                representation,
                convention,
                segments: BTreeMap::new(),
                absent: IndexRanges::new(),
                init: None,
            });
    }

    /// Moves `segment` to `state`. Returns whether the transition happened.
    ///
    /// Transitions that would move a segment backwards are ignored, which also makes
    /// recording the same discovery twice a no-op.
    pub fn record(&self, segment: &SegmentRef, state: SegmentState) -> bool {
        let mut tracks = self.tracks.lock();
        let Some(track) = tracks.get_mut(&segment.representation) else {
            tracing::warn!(
                "Segment {} of unknown representation {} ignored.",
                segment.index,
                segment.representation
            );
            return false;
        };

        let current = track.state(segment.index);
        if !current.can_transition_to(state) {
            return false;
        }

        if state == SegmentState::ProbedAbsent {
            return track.absent.insert(segment.index);
        }
        if current == SegmentState::ProbedAbsent {
            track.absent.remove(segment.index);
        }

        let entry = track
            .segments
            .entry(segment.index)
            .or_insert_with(|| segment.clone());
        entry.state = state;
        if state == SegmentState::Downloaded {
            entry.path = segment.path.clone();
        }
        true
    }

    pub fn state(&self, representation: &str, index: u64) -> SegmentState {
        self.tracks
            .lock()
            .get(representation)
            .map(|track| track.state(index))
            .unwrap_or(SegmentState::Unknown)
    }

    pub fn set_init_segment(&self, representation: &str, path: PathBuf) {
        if let Some(track) = self.tracks.lock().get_mut(representation) {
            track.init = Some(path);
        }
    }

    /// Downloaded segments of `representation`, by strictly increasing index.
    pub fn ordered_segments(&self, representation: &str) -> Vec<SegmentRef> {
        self.tracks
            .lock()
            .get(representation)
            .map(|track| {
                track
                    .segments
                    .values()
                    .filter(|s| s.state == SegmentState::Downloaded)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn window(&self, representation: &str) -> Option<DiscoveryWindow> {
        let tracks = self.tracks.lock();
        let segments = &tracks.get(representation)?.segments;
        let oldest = *segments.keys().next()?;
        let newest = *segments.keys().next_back()?;
        Some(DiscoveryWindow::new(oldest, newest))
    }

    /// Marks every segment that has not reached a terminal state as missing.
    ///
    /// Returns the number of segments settled this way.
    pub fn settle_pending(&self) -> usize {
        let mut settled = 0;
        for track in self.tracks.lock().values_mut() {
            for segment in track.segments.values_mut() {
                if !segment.state.is_terminal() {
                    segment.state = SegmentState::Missing;
                    settled += 1;
                }
            }
        }
        settled
    }

    pub fn tracks(&self) -> Vec<MergeTrack> {
        self.tracks
            .lock()
            .values()
            .map(|track| MergeTrack {
                representation: track.representation.clone(),
                init: track.init.clone(),
                entries: track
                    .segments
                    .values()
                    .map(|segment| match (&segment.state, &segment.path) {
                        (SegmentState::Downloaded, Some(path)) => TrackEntry::Segment {
                            index: segment.index,
                            path: path.clone(),
                        },
                        _ => TrackEntry::Gap {
                            index: segment.index,
                        },
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> Summary {
        Summary {
            representations: self
                .tracks
                .lock()
                .values()
                .map(TrackLedger::summarize)
                .collect(),
        }
    }
}
