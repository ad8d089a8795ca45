//! How a segment index maps onto segment addresses and presentation time.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::dash::{template::Template, AdvertisedSegment, Representation};

/// Which way past discovery walks the index space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDirection {
    /// From the oldest live index down to zero.
    #[default]
    Backward,
    /// From a seed (the broadcast's first frame time when known) up to the live window.
    Forward,
}

impl FromStr for SearchDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backward" | "backwards" => Ok(Self::Backward),
            "forward" | "forwards" => Ok(Self::Forward),
            _ => Err(format!("unknown search direction: {s}")),
        }
    }
}

impl fmt::Display for SearchDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backward => f.write_str("backward"),
            Self::Forward => f.write_str("forward"),
        }
    }
}

pub trait IndexConvention: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Template identifier the index is substituted for.
    fn variable(&self) -> &'static str;

    fn index_of(&self, segment: &AdvertisedSegment) -> u64;

    /// Whether every index between two produced segments is itself a segment.
    ///
    /// Sparse conventions address segments by start time, so most indices never exist.
    fn is_contiguous(&self) -> bool;

    /// Lowest index a segment can have.
    fn first_index(&self, representation: &Representation) -> u64;

    /// Where a forward search starts.
    fn forward_seed(&self, representation: &Representation, publish_frame_time: Option<u64>)
        -> u64;

    fn presentation_time(&self, representation: &Representation, index: u64) -> Duration;

    /// How far apart consecutive segments are expected, for conventions where most
    /// indices are unused.
    fn stride(&self, _representation: &Representation) -> Option<Stride> {
        None
    }
}

/// Nominal distance between the indices of two consecutive segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    pub duration: u64,
    /// How far a segment may start from where the nominal duration puts it.
    pub tolerance: u64,
}

impl Stride {
    pub fn new(duration: u64) -> Self {
        Self {
            duration,
            tolerance: (duration / 4).max(1),
        }
    }

    /// Expected indices of the segments lost between two present ones, both excluded.
    ///
    /// Works in either direction. Gaps that fit one segment within the tolerance are not
    /// losses.
    pub fn skipped(&self, from: u64, to: u64) -> Vec<u64> {
        let gap = from.abs_diff(to);
        if self.duration == 0 || gap <= self.duration + self.tolerance {
            return Vec::new();
        }

        let lost = (gap + self.duration / 2) / self.duration - 1;
        (1..=lost)
            .map(|k| {
                let offset = k * self.duration;
                if to > from {
                    from + offset
                } else {
                    from - offset
                }
            })
            .collect()
    }
}

/// `$Time$` addressing. Instagram live uses this, with a millisecond timescale.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeConvention;

impl IndexConvention for TimeConvention {
    fn name(&self) -> &'static str {
        "time"
    }

    fn variable(&self) -> &'static str {
        Template::TIME
    }

    fn index_of(&self, segment: &AdvertisedSegment) -> u64 {
        segment.time
    }

    fn is_contiguous(&self) -> bool {
        false
    }

    fn first_index(&self, _representation: &Representation) -> u64 {
        0
    }

    fn forward_seed(
        &self,
        _representation: &Representation,
        publish_frame_time: Option<u64>,
    ) -> u64 {
        publish_frame_time.unwrap_or(0)
    }

    fn presentation_time(&self, representation: &Representation, index: u64) -> Duration {
        ticks_to_duration(index, representation.timescale)
    }

    fn stride(&self, representation: &Representation) -> Option<Stride> {
        representation
            .segment_duration
            .filter(|d| *d > 0)
            .map(Stride::new)
    }
}

/// `$Number$` addressing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberConvention;

impl IndexConvention for NumberConvention {
    fn name(&self) -> &'static str {
        "number"
    }

    fn variable(&self) -> &'static str {
        Template::NUMBER
    }

    fn index_of(&self, segment: &AdvertisedSegment) -> u64 {
        segment.number
    }

    fn is_contiguous(&self) -> bool {
        true
    }

    // `@startNumber` of a live timeline is the head of its window, not of the broadcast
    fn first_index(&self, _representation: &Representation) -> u64 {
        0
    }

    fn forward_seed(
        &self,
        _representation: &Representation,
        _publish_frame_time: Option<u64>,
    ) -> u64 {
        0
    }

    fn presentation_time(&self, representation: &Representation, index: u64) -> Duration {
        let ticks = index.saturating_mul(representation.segment_duration.unwrap_or(0));
        ticks_to_duration(ticks, representation.timescale)
    }
}

fn ticks_to_duration(ticks: u64, timescale: u64) -> Duration {
    let timescale = timescale.max(1);
    let seconds = ticks / timescale;
    let nanos = (ticks % timescale) as u128 * 1_000_000_000 / timescale as u128;
    Duration::new(seconds, nanos as u32)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConventionKind {
    /// Picked from the media template, preferring `$Time$`.
    #[default]
    Auto,
    Time,
    Number,
}

impl ConventionKind {
    pub fn resolve(&self, media: &str) -> Arc<dyn IndexConvention> {
        match self {
            Self::Time => Arc::new(TimeConvention),
            Self::Number => Arc::new(NumberConvention),
            Self::Auto => {
                if !Template::mentions(media, Template::TIME)
                    && Template::mentions(media, Template::NUMBER)
                {
                    Arc::new(NumberConvention)
                } else {
                    Arc::new(TimeConvention)
                }
            }
        }
    }
}

impl FromStr for ConventionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "time" => Ok(Self::Time),
            "number" => Ok(Self::Number),
            _ => Err(format!("unknown index convention: {s}")),
        }
    }
}
