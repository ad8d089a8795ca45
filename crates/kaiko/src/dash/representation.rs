use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{template::Template, url::merge_baseurls};
use crate::{convention::IndexConvention, error::KaikoResult, util::format_bandwidth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let mime_type = mime_type.to_ascii_lowercase();
        if mime_type.starts_with("video") {
            Some(Self::Video)
        } else if mime_type.starts_with("audio") {
            Some(Self::Audio)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encoded variant of a track, with everything needed to address its segments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Representation {
    pub id: String,
    pub kind: TrackKind,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frame_rate: Option<String>,
    pub audio_sampling_rate: Option<String>,
    pub codecs: Option<String>,

    /// Fully resolved `BaseURL` of this representation.
    pub base_url: Url,
    /// `SegmentTemplate@media`
    pub media: String,
    /// `SegmentTemplate@initialization`
    pub initialization: Option<String>,
    pub timescale: u64,
    pub start_number: u64,
    /// Nominal segment duration in `timescale` units.
    pub segment_duration: Option<u64>,
}

impl Representation {
    fn template(&self) -> Template {
        Template::new()
            .with(Template::REPRESENTATION_ID, &self.id)
            .with(Template::BANDWIDTH, self.bandwidth)
    }

    pub fn segment_url(&self, convention: &dyn IndexConvention, index: u64) -> KaikoResult<Url> {
        let media = self
            .template()
            .with(convention.variable(), index)
            .resolve(&self.media);
        merge_baseurls(&self.base_url, &media)
    }

    pub fn init_url(&self) -> KaikoResult<Option<Url>> {
        self.initialization
            .as_deref()
            .map(|initialization| {
                let initialization = self.template().resolve(initialization);
                merge_baseurls(&self.base_url, &initialization)
            })
            .transpose()
    }

    pub fn resolution(&self) -> Option<String> {
        self.width
            .zip(self.height)
            .map(|(width, height)| format!("{width}x{height}"))
    }

    /// One line description used when logging the selected representation.
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("ID='{}'", self.id)];
        match self.kind {
            TrackKind::Video => {
                parts.push(format!(
                    "Resolution={}",
                    self.resolution().unwrap_or_else(|| "?x?".to_string())
                ));
                if let Some(frame_rate) = &self.frame_rate {
                    parts.push(format!("FrameRate='{frame_rate}'"));
                }
            }
            TrackKind::Audio => {
                if let Some(rate) = &self.audio_sampling_rate {
                    parts.push(format!("SamplingRate='{rate}'"));
                }
            }
        }
        parts.push(format!("Bandwidth={}", format_bandwidth(self.bandwidth)));
        parts.push(format!(
            "Codecs='{}'",
            self.codecs.as_deref().unwrap_or("unknown")
        ));
        parts.join(", ")
    }
}
