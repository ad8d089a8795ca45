use std::{
    future::Future,
    sync::{Arc, LazyLock},
    time::Duration,
};

use dash_mpd::{AdaptationSet, Representation as MpdRepresentation, S};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    representation::{Representation, TrackKind},
    url::resolve_base,
};
use crate::{
    error::{KaikoError, KaikoResult},
    util::http::HttpClient,
};

/// Response header Instagram sets on the manifest once the broadcast is over.
pub const BROADCAST_ENDED_HEADER: &str = "x-fb-video-broadcast-ended";

// Vendor attribute on the root element, the presentation time of the first frame.
static PUBLISH_FRAME_TIME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<MPD\b[^>]*?\bpublishFrameTime="(\d+)""#).unwrap());

/// A segment listed in the manifest's live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisedSegment {
    /// Start time in timescale units.
    pub time: u64,
    pub number: u64,
    pub duration: u64,
}

#[derive(Debug, Clone)]
pub struct AdvertisedRepresentation {
    pub representation: Arc<Representation>,
    /// The live window, oldest first.
    pub segments: Vec<AdvertisedSegment>,
}

/// What one manifest fetch told us.
#[derive(Debug, Clone, Default)]
pub struct ManifestSnapshot {
    pub representations: Vec<AdvertisedRepresentation>,
    pub publish_frame_time: Option<u64>,
    pub is_dynamic: bool,
    /// The origin reported the broadcast as finished.
    pub ended: bool,
}

impl ManifestSnapshot {
    pub fn parse(text: &str, manifest_url: &Url) -> KaikoResult<Self> {
        let mpd = dash_mpd::parse(text)?;

        let publish_frame_time = PUBLISH_FRAME_TIME_REGEX
            .captures(text)
            .and_then(|caps| caps[1].parse().ok());
        let is_dynamic = mpd.mpdtype.as_deref() == Some("dynamic");

        let mut representations: Vec<AdvertisedRepresentation> = Vec::new();
        let mpd_base = mpd.base_url.first().map(|b| b.base.as_str());
        for period in &mpd.periods {
            let period_base = period.BaseURL.first().map(|b| b.base.as_str());
            for adaptation in &period.adaptations {
                let adaptation_base = adaptation.BaseURL.first().map(|b| b.base.as_str());
                for representation in &adaptation.representations {
                    let representation_base =
                        representation.BaseURL.first().map(|b| b.base.as_str());
                    let levels = [mpd_base, period_base, adaptation_base, representation_base];
                    let base_url = resolve_base(manifest_url, levels.into_iter().flatten())?;

                    let Some(parsed) = parse_representation(base_url, adaptation, representation)
                    else {
                        continue;
                    };

                    // a later period supersedes an earlier one
                    representations
                        .retain(|r| r.representation.id != parsed.representation.id);
                    representations.push(parsed);
                }
            }
        }

        if representations.is_empty() {
            return Err(KaikoError::MpdParsing(
                "no audio or video representation with a SegmentTemplate".to_string(),
            ));
        }

        Ok(Self {
            representations,
            publish_frame_time,
            is_dynamic,
            ended: false,
        })
    }

    /// A snapshot carrying nothing but the end-of-broadcast signal.
    pub fn ended() -> Self {
        Self {
            ended: true,
            ..Default::default()
        }
    }

    pub fn representation(&self, id: &str) -> Option<&AdvertisedRepresentation> {
        self.representations
            .iter()
            .find(|r| r.representation.id == id)
    }

    /// Picks the first preferred id that exists, otherwise the highest bandwidth.
    pub fn select(&self, kind: TrackKind, preferred: &[String]) -> Option<&AdvertisedRepresentation> {
        let candidates = || {
            self.representations
                .iter()
                .filter(move |r| r.representation.kind == kind)
        };

        for id in preferred {
            if let Some(found) = candidates().find(|r| &r.representation.id == id) {
                tracing::info!(
                    "Found user-specified {kind} representation: {}",
                    found.representation.describe()
                );
                return Some(found);
            }
        }
        if !preferred.is_empty() {
            tracing::warn!(
                "None of the preferred {kind} ids found: {preferred:?}. Falling back to highest bandwidth."
            );
        }

        let best = candidates().max_by_key(|r| r.representation.bandwidth)?;
        tracing::info!(
            "Selected {kind} representation: {}",
            best.representation.describe()
        );
        Some(best)
    }
}

fn parse_representation(
    base_url: Url,
    adaptation: &AdaptationSet,
    representation: &MpdRepresentation,
) -> Option<AdvertisedRepresentation> {
    let id = representation.id.clone()?;
    let kind = [
        representation.mimeType.as_deref(),
        representation.contentType.as_deref(),
        adaptation.mimeType.as_deref(),
        adaptation.contentType.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(TrackKind::from_mime_type)?;

    let inner = representation.SegmentTemplate.as_ref();
    let outer = adaptation.SegmentTemplate.as_ref();

    let Some(media) = inner
        .and_then(|t| t.media.clone())
        .or_else(|| outer.and_then(|t| t.media.clone()))
    else {
        tracing::debug!("Representation {id} has no media template, skipped.");
        return None;
    };
    let initialization = inner
        .and_then(|t| t.initialization.clone())
        .or_else(|| outer.and_then(|t| t.initialization.clone()));
    let timescale = inner
        .and_then(|t| t.timescale)
        .or_else(|| outer.and_then(|t| t.timescale))
        .unwrap_or(1);
    let start_number = inner
        .and_then(|t| t.startNumber)
        .or_else(|| outer.and_then(|t| t.startNumber))
        .unwrap_or(1);
    let template_duration = inner
        .and_then(|t| t.duration)
        .or_else(|| outer.and_then(|t| t.duration))
        .map(|d| d as u64);

    let segments = inner
        .and_then(|t| t.SegmentTimeline.as_ref())
        .or_else(|| outer.and_then(|t| t.SegmentTimeline.as_ref()))
        .map(|timeline| expand_timeline(&timeline.segments, start_number))
        .unwrap_or_default();
    let segment_duration = segments.first().map(|s| s.duration).or(template_duration);

    Some(AdvertisedRepresentation {
        representation: Arc::new(Representation {
            id,
            kind,
            bandwidth: representation.bandwidth.unwrap_or(0),
            width: representation.width,
            height: representation.height,
            frame_rate: representation
                .frameRate
                .clone()
                .or_else(|| adaptation.frameRate.clone()),
            audio_sampling_rate: representation.audioSamplingRate.clone(),
            codecs: representation
                .codecs
                .clone()
                .or_else(|| adaptation.codecs.clone()),
            base_url,
            media,
            initialization,
            timescale,
            start_number,
            segment_duration,
        }),
        segments,
    })
}

fn expand_timeline(timeline: &[S], start_number: u64) -> Vec<AdvertisedSegment> {
    let mut segments = Vec::new();
    let mut time = 0;
    let mut number = start_number;

    for s in timeline {
        if let Some(t) = s.t {
            time = t;
        }
        if let Some(n) = s.n {
            number = n;
        }
        // negative repeat counts run to the next S element, which then carries `t`
        let repeat = s.r.unwrap_or(0).max(0) as u64;
        for _ in 0..=repeat {
            segments.push(AdvertisedSegment {
                time,
                number,
                duration: s.d,
            });
            time = time.saturating_add(s.d);
            number += 1;
        }
    }

    segments
}

pub trait ManifestSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = KaikoResult<ManifestSnapshot>> + Send;
}

#[derive(Clone)]
pub struct ManifestClient {
    client: HttpClient,
    url: Url,
    retries: u32,
    retry_delay: Duration,
    token: CancellationToken,
}

impl ManifestClient {
    pub fn new(client: HttpClient, url: Url) -> Self {
        Self {
            client,
            url,
            retries: 3,
            retry_delay: Duration::from_secs(1),
            token: CancellationToken::new(),
        }
    }

    /// Cancelling `token` interrupts the wait between two attempts.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_retry(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch_once(&self) -> KaikoResult<ManifestSnapshot> {
        let response = self.client.get(self.url.clone()).send().await?;
        let ended = response.headers().contains_key(BROADCAST_ENDED_HEADER);
        let status = response.status();

        if !status.is_success() {
            if ended {
                return Ok(ManifestSnapshot::ended());
            }
            return Err(KaikoError::HttpError(status));
        }

        let text = response.text().await?;
        match ManifestSnapshot::parse(&text, &self.url) {
            Ok(mut snapshot) => {
                snapshot.ended |= ended;
                Ok(snapshot)
            }
            Err(e) if ended => {
                tracing::debug!("Unparsable manifest at the end of the broadcast: {e}");
                Ok(ManifestSnapshot::ended())
            }
            Err(e) => Err(e),
        }
    }
}

impl ManifestSource for ManifestClient {
    async fn fetch(&self) -> KaikoResult<ManifestSnapshot> {
        let attempts = self.retries.max(1);
        let mut delay = self.retry_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt >= attempts => {
                    tracing::error!("Failed to fetch manifest after {attempts} attempt(s): {e}");
                    return Err(if e.is_transient() {
                        KaikoError::ManifestFetchError(attempts)
                    } else {
                        e
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to fetch manifest ({attempt}/{attempts}), retry in {delay:?}: {e}"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(KaikoError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}
