use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use clap::Args;
use fake_user_agent::get_chrome_rua;
use kaiko::{
    convention::{ConventionKind, SearchDirection},
    merge::{FfmpegMerger, KaikoMerger},
    RecorderConfig,
};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, Proxy,
};

#[derive(Args, Clone, Debug)]
pub struct HttpOptions {
    /// Additional HTTP headers, as `Name: value`
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// HTTP timeout, in seconds
    #[clap(short, long, default_value = "10")]
    pub timeout: u64,

    /// Proxy for every request, e.g. socks5://127.0.0.1:1080
    #[clap(long, env = "HTTPS_PROXY")]
    pub proxy: Option<String>,
}

impl HttpOptions {
    pub fn into_builder(self) -> anyhow::Result<ClientBuilder> {
        let mut headers = HeaderMap::new();

        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            headers.insert(
                HeaderName::from_str(key.trim()).context("Invalid header name")?,
                HeaderValue::from_str(value.trim()).context("Invalid header value")?,
            );
        }

        let mut builder = Client::builder()
            .default_headers(headers)
            .user_agent(get_chrome_rua())
            .timeout(Duration::from_secs(self.timeout));
        if let Some(proxy) = self.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(builder)
    }
}

#[derive(Args, Clone, Debug)]
pub struct SearchOptions {
    /// Only record from the live edge, without searching for earlier segments
    #[clap(long)]
    pub no_past: bool,

    /// Direction of the past segment search: backward or forward
    #[clap(long, default_value = "backward")]
    pub direction: SearchDirection,

    /// How segment indices are derived: auto, time or number
    #[clap(long, default_value = "auto")]
    pub convention: ConventionKind,

    /// Candidate indices probed in one round
    #[clap(long, default_value = "500")]
    pub search_chunk_size: NonZeroU64,

    /// Consecutive absent indices that end the search
    #[clap(long, default_value = "30000")]
    pub miss_threshold: NonZeroU64,

    /// Probes in flight, shared by video and audio
    #[clap(long, default_value = "50")]
    pub max_search_requests: NonZeroUsize,

    /// Attempts for each probe before the index is left unresolved
    #[clap(long, default_value = "3")]
    pub check_retries: u32,
}

#[derive(Args, Clone, Debug)]
pub struct DownloadOptions {
    /// Threads limit
    #[clap(long, alias = "threads", default_value = "5")]
    pub concurrency: NonZeroU32,

    /// Segment retry limit
    #[clap(long, default_value = "5")]
    pub segment_retries: u32,

    /// Manifest retry limit
    #[clap(long, default_value = "3")]
    pub manifest_retries: u32,

    /// Delay between two past segment downloads, in milliseconds
    #[clap(long, default_value = "100")]
    pub past_delay: u64,
}

#[derive(Args, Clone, Debug)]
pub struct StreamOptions {
    /// Manifest refresh interval, in seconds
    #[clap(long, default_value = "2")]
    pub poll_interval: f64,

    /// Seconds without a new segment after which the broadcast is considered over
    #[clap(long, default_value = "180")]
    pub live_end_timeout: u64,

    /// Preferred video representation ids, in order
    #[clap(long = "video-id")]
    pub video_ids: Vec<String>,

    /// Preferred audio representation ids, in order
    #[clap(long = "audio-id")]
    pub audio_ids: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct OutputOptions {
    /// Output file path
    #[clap(short, long, default_value = "./output.mp4")]
    pub output: PathBuf,

    /// Directory of the downloaded segments, defaults to `<output>_segments`
    #[clap(long)]
    pub segments_dir: Option<PathBuf>,

    /// Do not merge segments after recording
    #[clap(long)]
    pub no_merge: bool,

    /// Keep downloaded segments after merging
    #[clap(long)]
    pub keep_segments: bool,

    /// Path of the ffmpeg executable, looked up in PATH by default
    #[clap(long, env = "FFMPEG")]
    pub ffmpeg: Option<PathBuf>,

    /// Extra arguments passed to ffmpeg before the output file
    #[clap(long)]
    pub ffmpeg_args: Option<String>,

    /// Write a plain text summary of the recording
    #[clap(long)]
    pub summary: Option<PathBuf>,

    /// Write the plain text summary in Korean
    #[clap(long)]
    pub summary_ko: Option<PathBuf>,

    /// Write the summary as JSON
    #[clap(long)]
    pub summary_json: Option<PathBuf>,
}

impl OutputOptions {
    pub fn segments_dir(&self) -> PathBuf {
        self.segments_dir.clone().unwrap_or_else(|| {
            let stem = self
                .output
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string());
            self.output.with_file_name(format!("{stem}_segments"))
        })
    }

    pub fn merger(&self) -> KaikoMerger {
        if self.no_merge {
            return KaikoMerger::skip();
        }

        KaikoMerger::Ffmpeg(
            FfmpegMerger::new(self.output.clone(), self.keep_segments)
                .with_ffmpeg(self.ffmpeg.clone())
                .with_extra_args(self.ffmpeg_args.clone()),
        )
    }
}

pub fn recorder_config(
    search: &SearchOptions,
    download: &DownloadOptions,
    stream: &StreamOptions,
) -> RecorderConfig {
    RecorderConfig {
        poll_interval: Duration::from_secs_f64(stream.poll_interval.max(0.1)),
        max_search_requests: search.max_search_requests,
        download_concurrency: download.concurrency,
        download_retries: download.segment_retries,
        manifest_retries: download.manifest_retries,
        check_url_retries: search.check_retries,
        end_stream_miss_threshold: search.miss_threshold,
        search_chunk_size: search.search_chunk_size,
        live_end_timeout: Duration::from_secs(stream.live_end_timeout),
        past_segment_delay: Duration::from_millis(download.past_delay),
        past_enabled: !search.no_past,
        search_direction: search.direction,
        convention: search.convention,
        video_preference: stream.video_ids.clone(),
        audio_preference: stream.audio_ids.clone(),
        ..Default::default()
    }
}
