mod args;

use std::{path::PathBuf, sync::Mutex};

use clap::Parser;
use kaiko::{
    cancel_on_ctrl_c,
    dash::ManifestClient,
    merge::Merger,
    probe::HttpExistenceProbe,
    storage::SegmentStorage,
    summary::ReportLanguage,
    util::http::HttpClient,
    Recorder,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};
use url::Url;

use crate::args::{
    recorder_config, DownloadOptions, HttpOptions, OutputOptions, SearchOptions, StreamOptions,
};

/// Record an MPEG-DASH live broadcast, including what aired before you joined.
#[derive(Parser, Debug, Clone)]
#[clap(name = "kaiko", version)]
pub struct KaikoArgs {
    /// Debug output
    #[clap(short, long, alias = "debug")]
    verbose: bool,

    /// Only print warnings and errors
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Also write the log, without colors, to this file
    #[clap(long)]
    log_file: Option<PathBuf>,

    #[clap(flatten)]
    http: HttpOptions,

    #[clap(flatten)]
    search: SearchOptions,

    #[clap(flatten)]
    download: DownloadOptions,

    #[clap(flatten)]
    stream: StreamOptions,

    #[clap(flatten)]
    output: OutputOptions,

    /// URL of the MPD manifest
    url: String,
}

impl KaikoArgs {
    async fn record(self) -> anyhow::Result<()> {
        let url = Url::parse(&self.url)?;
        let config = recorder_config(&self.search, &self.download, &self.stream);
        let client = HttpClient::new(self.http.into_builder()?)?;

        let token = CancellationToken::new();
        cancel_on_ctrl_c(token.clone());

        let manifest = ManifestClient::new(client.clone(), url)
            .with_retry(config.manifest_retries, config.manifest_retry_delay)
            .with_cancellation(token.clone());
        let probe = HttpExistenceProbe::new(client.clone(), config.check_url_timeout);
        let storage = SegmentStorage::new(self.output.segments_dir());

        let recorder =
            Recorder::new(manifest, probe, client, storage, config).with_cancellation(token);
        let recording = recorder.run().await?;

        let mut merger = self.output.merger();
        let merged = merger.merge(&recording).await;

        let title = self
            .output
            .output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_size = match &merged {
            Ok(Some(path)) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or_default(),
            _ => 0,
        };

        let summary = &recording.summary;
        if let Some(path) = &self.output.summary {
            summary
                .write_report(path, &title, file_size, ReportLanguage::English)
                .await?;
        }
        if let Some(path) = &self.output.summary_ko {
            summary
                .write_report(path, &title, file_size, ReportLanguage::Korean)
                .await?;
        }
        if let Some(path) = &self.output.summary_json {
            summary.write_json(path).await?;
        }

        if !summary.is_lossless() {
            log::warn!(
                "{} segment(s) could not be recorded.",
                summary.total_missing()
            );
        }
        merged?;

        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = KaikoArgs::parse();

    let level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else if args.quiet {
        tracing_subscriber::filter::LevelFilter::WARN
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    };
    let file_layer = match &args.log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(std::fs::File::create(path)?))
                .with_filter(filter()),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .with(file_layer)
        .init();

    args.record().await
}
