use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    time::Duration,
};

use crate::convention::{ConventionKind, SearchDirection};

/// Tunables of a single recording run.
///
/// Defaults follow what works against Instagram's live edge servers.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Interval between two manifest refreshes while live.
    pub poll_interval: Duration,
    /// Maximum number of existence probes in flight, shared by every representation.
    pub max_search_requests: NonZeroUsize,
    /// Maximum number of segment downloads in flight, shared by every representation.
    pub download_concurrency: NonZeroU32,
    /// Total attempts for each segment download.
    pub download_retries: u32,
    /// Initial backoff between download attempts. Doubled after every failure.
    pub download_retry_delay: Duration,
    /// Upper bound of the download backoff.
    pub download_retry_max_delay: Duration,
    /// Attempts for manifest fetches.
    pub manifest_retries: u32,
    pub manifest_retry_delay: Duration,
    /// Attempts for an existence probe before the index is left unresolved.
    pub check_url_retries: u32,
    pub check_url_retry_delay: Duration,
    pub check_url_timeout: Duration,
    /// Consecutive absent probes after which past discovery stops.
    pub end_stream_miss_threshold: NonZeroU64,
    /// Number of candidate indices probed concurrently in one round.
    pub search_chunk_size: NonZeroU64,
    /// Live acquisition ends once a representation has produced nothing new for this long.
    pub live_end_timeout: Duration,
    /// Minimum delay between two past segment download starts.
    pub past_segment_delay: Duration,
    /// Whether segments older than the live window are searched for at all.
    pub past_enabled: bool,
    pub search_direction: SearchDirection,
    pub convention: ConventionKind,
    /// Ordered representation ids to prefer, falling back to the highest bandwidth.
    pub video_preference: Vec<String>,
    pub audio_preference: Vec<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_search_requests: NonZeroUsize::new(50).unwrap_or(NonZeroUsize::MIN),
            download_concurrency: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            download_retries: 5,
            download_retry_delay: Duration::from_secs(1),
            download_retry_max_delay: Duration::from_secs(30),
            manifest_retries: 3,
            manifest_retry_delay: Duration::from_secs(1),
            check_url_retries: 3,
            check_url_retry_delay: Duration::from_millis(500),
            check_url_timeout: Duration::from_secs(3),
            end_stream_miss_threshold: NonZeroU64::new(30000).unwrap_or(NonZeroU64::MIN),
            search_chunk_size: NonZeroU64::new(500).unwrap_or(NonZeroU64::MIN),
            live_end_timeout: Duration::from_secs(180),
            past_segment_delay: Duration::from_millis(100),
            past_enabled: true,
            search_direction: SearchDirection::default(),
            convention: ConventionKind::default(),
            video_preference: Vec::new(),
            audio_preference: Vec::new(),
        }
    }
}
