use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use kaiko::{
    convention::NumberConvention,
    dash::Representation,
    fetch::{FetchReport, SegmentFetcher},
    ledger::{SegmentLedger, SegmentRef, SegmentState},
    storage::SegmentStorage,
    util::{
        http::{HttpClient, SegmentSource},
        retry::RetryPolicy,
    },
    KaikoError, KaikoResult, RecorderConfig,
};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{index_of, numbered_representation};

struct Fixture {
    server: MockServer,
    representation: Arc<Representation>,
    ledger: Arc<SegmentLedger>,
    storage: SegmentStorage,
    fetcher: SegmentFetcher<HttpClient>,
    _dir: TempDir,
}

impl Fixture {
    async fn new() -> anyhow::Result<Self> {
        let server = MockServer::start().await;
        let representation = Arc::new(numbered_representation(
            "v1",
            &format!("{}/live/manifest.mpd", server.uri()),
        ));

        let ledger = Arc::new(SegmentLedger::new());
        ledger.register(representation.clone(), Arc::new(NumberConvention));

        let dir = tempfile::tempdir()?;
        let storage = SegmentStorage::new(dir.path().join("segments"));
        storage.prepare(&representation.id).await?;

        let config = RecorderConfig {
            past_segment_delay: Duration::ZERO,
            ..Default::default()
        };
        let fetcher = SegmentFetcher::new(
            HttpClient::default(),
            ledger.clone(),
            storage.clone(),
            &config,
            CancellationToken::new(),
        )
        .with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(20),
        ));

        Ok(Self {
            server,
            representation,
            ledger,
            storage,
            fetcher,
            _dir: dir,
        })
    }

    fn discovered(&self, index: u64) -> anyhow::Result<SegmentRef> {
        let url = self
            .representation
            .segment_url(&NumberConvention, index)?;
        let segment = SegmentRef::new("v1", index, url);
        self.ledger.record(&segment, SegmentState::Discovered);
        Ok(segment)
    }

    fn leftovers(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.storage.representation_dir("v1"))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(".part") {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/7.m4v"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&fixture.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/7.m4v"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"segment-7".to_vec()))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let state = fixture.fetcher.download(fixture.discovered(7)?).await;

    assert_eq!(state, SegmentState::Downloaded);
    assert_eq!(fixture.ledger.state("v1", 7), SegmentState::Downloaded);
    let saved = tokio::fs::read(fixture.storage.segment_path("v1", 7)).await?;
    assert_eq!(saved, b"segment-7");
    assert!(fixture.leftovers()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_mark_missing() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/3.m4v"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&fixture.server)
        .await;

    let state = fixture.fetcher.download(fixture.discovered(3)?).await;

    assert_eq!(state, SegmentState::Missing);
    assert_eq!(fixture.ledger.state("v1", 3), SegmentState::Missing);
    assert!(!fixture.storage.segment_path("v1", 3).exists());
    assert!(fixture.leftovers()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_not_found_is_not_retried() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/4.m4v"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let state = fixture.fetcher.download(fixture.discovered(4)?).await;
    assert_eq!(state, SegmentState::Missing);
    Ok(())
}

#[tokio::test]
async fn test_completed_file_is_not_downloaded_again() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .expect(0)
        .mount(&fixture.server)
        .await;
    tokio::fs::write(fixture.storage.segment_path("v1", 5), b"earlier run").await?;

    let state = fixture.fetcher.download(fixture.discovered(5)?).await;

    assert_eq!(state, SegmentState::Downloaded);
    let saved = tokio::fs::read(fixture.storage.segment_path("v1", 5)).await?;
    assert_eq!(saved, b"earlier run");
    Ok(())
}

#[tokio::test]
async fn test_queues_drain_before_finish() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path_regex(r"^/live/seg/v1/[1-4]\.m4v$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(4)
        .mount(&fixture.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/5.m4v"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fixture.server)
        .await;

    let handle = fixture.fetcher.start();
    let (past, live) = (handle.past_queue(), handle.live_queue());
    for index in [2, 1] {
        assert!(past.push(fixture.discovered(index)?));
    }
    for index in [3, 4, 5] {
        assert!(live.push(fixture.discovered(index)?));
    }
    drop((past, live));

    let report = handle.finish().await;
    assert_eq!(
        report,
        FetchReport {
            downloaded: 4,
            missing: 1
        }
    );

    let ordered: Vec<u64> = fixture
        .ledger
        .ordered_segments("v1")
        .iter()
        .map(|s| s.index)
        .collect();
    assert_eq!(ordered, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_init_segment() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/init.m4v"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ftyp".to_vec()))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let saved = fixture.fetcher.download_init(&fixture.representation).await?;

    assert_eq!(saved, Some(fixture.storage.init_path("v1")));
    assert_eq!(tokio::fs::read(fixture.storage.init_path("v1")).await?, b"ftyp");
    assert_eq!(
        fixture.ledger.tracks()[0].init,
        Some(fixture.storage.init_path("v1"))
    );
    Ok(())
}

#[tokio::test]
async fn test_init_segment_unavailable() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    Mock::given(method("GET"))
        .and(path("/live/seg/v1/init.m4v"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&fixture.server)
        .await;

    let result = fixture.fetcher.download_init(&fixture.representation).await;
    assert!(matches!(result, Err(KaikoError::InitSegmentUnavailable(_))));
    Ok(())
}

/// Answers every request at once, noting when each fetch started.
#[derive(Clone, Default)]
struct TimedSource {
    starts: Arc<Mutex<Vec<(u64, Instant)>>>,
}

impl SegmentSource for TimedSource {
    async fn fetch_segment(&self, url: &Url) -> KaikoResult<Bytes> {
        let index = index_of(url).unwrap_or_default();
        self.starts.lock().unwrap().push((index, Instant::now()));
        Ok(Bytes::from_static(b"data"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_past_downloads_are_paced() -> anyhow::Result<()> {
    let representation = Arc::new(numbered_representation(
        "v1",
        "https://cdn.example.com/live/manifest.mpd",
    ));
    let ledger = Arc::new(SegmentLedger::new());
    ledger.register(representation.clone(), Arc::new(NumberConvention));

    let dir = tempfile::tempdir()?;
    let storage = SegmentStorage::new(dir.path().join("segments"));
    storage.prepare("v1").await?;

    let delay = Duration::from_millis(100);
    let config = RecorderConfig {
        past_segment_delay: delay,
        ..Default::default()
    };
    let source = TimedSource::default();
    let fetcher = SegmentFetcher::new(
        source.clone(),
        ledger.clone(),
        storage,
        &config,
        CancellationToken::new(),
    );

    let discovered = |index: u64| -> anyhow::Result<SegmentRef> {
        let url = representation.segment_url(&NumberConvention, index)?;
        let segment = SegmentRef::new("v1", index, url);
        ledger.record(&segment, SegmentState::Discovered);
        Ok(segment)
    };

    let handle = fetcher.start();
    let past = handle.past_queue();
    for index in 1..=4 {
        assert!(past.push(discovered(index)?));
    }
    drop(past);

    let report = handle.finish().await;
    assert_eq!(
        report,
        FetchReport {
            downloaded: 4,
            missing: 0
        }
    );

    let starts = source.starts.lock().unwrap().clone();
    let order: Vec<u64> = starts.iter().map(|(index, _)| *index).collect();
    assert_eq!(order, vec![1, 2, 3, 4]);
    for pair in starts.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= delay, "{} started {gap:?} after {}", pair[1].0, pair[0].0);
    }
    Ok(())
}
