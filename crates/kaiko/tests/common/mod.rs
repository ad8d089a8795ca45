use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use kaiko::{
    dash::{
        AdvertisedRepresentation, AdvertisedSegment, ManifestSnapshot, ManifestSource,
        Representation, TrackKind,
    },
    probe::{ExistenceProbe, ProbeOutcome},
    KaikoResult,
};
use url::Url;

pub const MANIFEST_URL: &str = "https://cdn.example.com/live/manifest.mpd?ccb=1";

pub fn numbered_representation(id: &str, base: &str) -> Representation {
    Representation {
        id: id.to_string(),
        kind: TrackKind::Video,
        bandwidth: 1_000_000,
        width: Some(720),
        height: Some(1280),
        frame_rate: None,
        audio_sampling_rate: None,
        codecs: Some("avc1.64001f".to_string()),
        base_url: Url::parse(base).unwrap(),
        media: "seg/$RepresentationID$/$Number$.m4v".to_string(),
        initialization: Some("seg/$RepresentationID$/init.m4v".to_string()),
        timescale: 1000,
        start_number: 1,
        segment_duration: Some(2000),
    }
}

pub fn timed_representation(id: &str) -> Representation {
    Representation {
        media: "seg/$RepresentationID$/$Time$.m4v".to_string(),
        ..numbered_representation(id, MANIFEST_URL)
    }
}

/// Index a segment url was built for, read back from its file name.
pub fn index_of(url: &Url) -> Option<u64> {
    url.path_segments()?
        .next_back()?
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Answers probes from a closure, remembering what was asked.
pub struct ScriptedProbe<F> {
    answer: F,
    checks: Mutex<HashMap<u64, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl<F> ScriptedProbe<F>
where
    F: Fn(u64) -> ProbeOutcome + Send + Sync + 'static,
{
    pub fn new(answer: F) -> Self {
        Self {
            answer,
            checks: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn checked(&self) -> Vec<u64> {
        let mut checked: Vec<u64> = self.checks.lock().unwrap().keys().copied().collect();
        checked.sort_unstable();
        checked
    }

    pub fn checks_of(&self, index: u64) -> usize {
        self.checks
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl<F> ExistenceProbe for ScriptedProbe<F>
where
    F: Fn(u64) -> ProbeOutcome + Send + Sync + 'static,
{
    async fn check(&self, url: &Url) -> ProbeOutcome {
        let Some(index) = index_of(url) else {
            return ProbeOutcome::Absent;
        };
        *self.checks.lock().unwrap().entry(index).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.answer)(index)
    }
}

/// A live window listing `indices` for `representation`, addressable by time or number.
pub fn advertise(
    representation: &Arc<Representation>,
    indices: impl IntoIterator<Item = u64>,
) -> ManifestSnapshot {
    ManifestSnapshot {
        representations: vec![AdvertisedRepresentation {
            representation: representation.clone(),
            segments: indices
                .into_iter()
                .map(|index| AdvertisedSegment {
                    time: index,
                    number: index,
                    duration: 2000,
                })
                .collect(),
        }],
        publish_frame_time: None,
        is_dynamic: true,
        ended: false,
    }
}

/// Serves snapshots in order, repeating the last one forever.
pub struct ScriptedManifest {
    snapshots: Vec<ManifestSnapshot>,
    fetches: AtomicUsize,
}

impl ScriptedManifest {
    pub fn new(snapshots: Vec<ManifestSnapshot>) -> Self {
        assert!(!snapshots.is_empty());
        Self {
            snapshots,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ManifestSource for ScriptedManifest {
    async fn fetch(&self) -> KaikoResult<ManifestSnapshot> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
        let snapshot = self
            .snapshots
            .get(fetch)
            .or_else(|| self.snapshots.last())
            .cloned()
            .unwrap_or_default();
        Ok(snapshot)
    }
}
