use std::{sync::Arc, time::Duration};

use kaiko::{
    convention::{IndexConvention, NumberConvention, SearchDirection, TimeConvention},
    dash::Representation,
    fetch::FetchQueue,
    ledger::{DiscoveryWindow, SegmentLedger, SegmentRef, SegmentState},
    locator::{LocatorReport, PastSegmentLocator, SearchConfig, SearchEnd},
    probe::ProbeOutcome,
};
use tokio::sync::{mpsc::UnboundedReceiver, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::common::{numbered_representation, timed_representation, ScriptedProbe, MANIFEST_URL};

fn config(chunk_size: u64, miss_threshold: u64) -> SearchConfig {
    SearchConfig {
        direction: SearchDirection::Backward,
        chunk_size,
        miss_threshold,
        check_attempts: 1,
        check_retry_delay: Duration::ZERO,
    }
}

struct Search {
    representation: Arc<Representation>,
    convention: Arc<dyn IndexConvention>,
    ledger: Arc<SegmentLedger>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
}

impl Search {
    fn new(representation: Representation, convention: Arc<dyn IndexConvention>) -> Self {
        let representation = Arc::new(representation);
        let ledger = Arc::new(SegmentLedger::new());
        ledger.register(representation.clone(), convention.clone());

        Self {
            representation,
            convention,
            ledger,
            permits: Arc::new(Semaphore::new(50)),
            token: CancellationToken::new(),
        }
    }

    fn numbered() -> Self {
        Self::new(
            numbered_representation("v1", MANIFEST_URL),
            Arc::new(NumberConvention),
        )
    }

    fn timed() -> Self {
        Self::new(timed_representation("v1"), Arc::new(TimeConvention))
    }

    async fn run<F>(
        &self,
        probe: &Arc<ScriptedProbe<F>>,
        window: DiscoveryWindow,
        config: SearchConfig,
    ) -> anyhow::Result<(LocatorReport, Vec<u64>)>
    where
        F: Fn(u64) -> ProbeOutcome + Send + Sync + 'static,
    {
        self.run_seeded(probe, window, config, None).await
    }

    async fn run_seeded<F>(
        &self,
        probe: &Arc<ScriptedProbe<F>>,
        window: DiscoveryWindow,
        config: SearchConfig,
        publish_frame_time: Option<u64>,
    ) -> anyhow::Result<(LocatorReport, Vec<u64>)>
    where
        F: Fn(u64) -> ProbeOutcome + Send + Sync + 'static,
    {
        let (queue, receiver) = FetchQueue::channel();
        let report = PastSegmentLocator::new(
            probe.clone(),
            self.ledger.clone(),
            self.representation.clone(),
            self.convention.clone(),
            window,
            config,
            self.permits.clone(),
            self.token.clone(),
        )
        .with_publish_frame_time(publish_frame_time)
        .run(&queue)
        .await?;

        drop(queue);
        Ok((report, drain(receiver).await))
    }

    fn state(&self, index: u64) -> SegmentState {
        self.ledger.state(&self.representation.id, index)
    }
}

async fn drain(mut receiver: UnboundedReceiver<SegmentRef>) -> Vec<u64> {
    let mut queued = Vec::new();
    while let Some(segment) = receiver.recv().await {
        queued.push(segment.index);
    }
    queued
}

#[tokio::test]
async fn test_reaches_index_zero_across_short_gap() -> anyhow::Result<()> {
    let search = Search::numbered();
    let probe = Arc::new(ScriptedProbe::new(|index| {
        if (50..=54).contains(&index) {
            ProbeOutcome::Absent
        } else {
            ProbeOutcome::Present
        }
    }));

    let (report, queued) = search
        .run(
            &probe,
            DiscoveryWindow::new(100_000, 100_010),
            config(500, 30_000),
        )
        .await?;

    assert_eq!(report.end, SearchEnd::IndexSpaceExhausted);
    assert_eq!(report.oldest, 0);
    assert_eq!(report.probed, 100_000);
    assert_eq!(report.discovered, 99_995);
    assert_eq!(report.missing, 5);
    assert_eq!(queued.len(), 99_995);

    for index in 50..=54 {
        assert_eq!(search.state(index), SegmentState::Missing);
    }
    assert_eq!(search.state(49), SegmentState::Discovered);
    assert_eq!(search.state(55), SegmentState::Discovered);

    let summary = search.ledger.snapshot();
    let video = summary.representation("v1").unwrap();
    let missing: Vec<u64> = video.missing_segments.iter().map(|m| m.index).collect();
    assert_eq!(missing, vec![50, 51, 52, 53, 54]);
    assert_eq!(video.first_index, Some(0));

    Ok(())
}

#[tokio::test]
async fn test_stops_exactly_at_miss_threshold() -> anyhow::Result<()> {
    let search = Search::numbered();
    let probe = Arc::new(ScriptedProbe::new(|index| {
        if index < 1000 {
            ProbeOutcome::Absent
        } else {
            ProbeOutcome::Present
        }
    }));

    let (report, queued) = search
        .run(&probe, DiscoveryWindow::new(1000, 1010), config(30, 100))
        .await?;

    assert_eq!(report.end, SearchEnd::MissThreshold);
    assert_eq!(report.probed, 100);
    assert_eq!(report.discovered, 0);
    assert_eq!(report.missing, 0);
    assert_eq!(report.oldest, 1000);
    assert!(queued.is_empty());

    // nothing beyond the terminating run is ever probed
    assert_eq!(probe.checked(), (900..1000).collect::<Vec<_>>());
    assert_eq!(search.state(950), SegmentState::ProbedAbsent);
    assert_eq!(search.state(899), SegmentState::Unknown);

    let summary = search.ledger.snapshot();
    assert_eq!(summary.representation("v1").unwrap().probed_absent, 100);
    Ok(())
}

#[tokio::test]
async fn test_time_addressed_search_steps_by_segment_duration() -> anyhow::Result<()> {
    let search = Search::timed();
    let probe = Arc::new(ScriptedProbe::new(|time| {
        if time >= 4000 && time % 2000 == 0 {
            ProbeOutcome::Present
        } else {
            ProbeOutcome::Absent
        }
    }));

    let (report, queued) = search
        .run(
            &probe,
            DiscoveryWindow::new(10_000, 12_000),
            config(500, 30_000),
        )
        .await?;

    assert_eq!(report.end, SearchEnd::IndexSpaceExhausted);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.missing, 0);
    assert_eq!(report.oldest, 4000);
    assert_eq!(queued, vec![8000, 6000, 4000]);

    // one probe per segment, then the window around 2000 and every tick below it
    assert_eq!(report.probed, 3 + 1001 + 1500);
    assert_eq!(probe.checks_of(8000), 1);
    assert_eq!(search.state(5000), SegmentState::Unknown);
    assert_eq!(search.state(2000), SegmentState::ProbedAbsent);
    assert_eq!(search.state(1000), SegmentState::ProbedAbsent);
    Ok(())
}

#[tokio::test]
async fn test_lost_time_addressed_segment_is_missing() -> anyhow::Result<()> {
    let search = Search::timed();
    let probe = Arc::new(ScriptedProbe::new(|time| {
        if time % 2000 == 0 && time != 10_000 {
            ProbeOutcome::Present
        } else {
            ProbeOutcome::Absent
        }
    }));

    let (report, queued) = search
        .run(
            &probe,
            DiscoveryWindow::new(20_000, 22_000),
            config(500, 30_000),
        )
        .await?;

    assert_eq!(report.end, SearchEnd::IndexSpaceExhausted);
    assert_eq!(report.discovered, 9);
    assert_eq!(report.missing, 1);
    assert_eq!(report.oldest, 0);
    assert_eq!(report.probed, 4 + 1001 + 1500 + 4);
    assert_eq!(queued.len(), 9);
    assert_eq!(search.state(10_000), SegmentState::Missing);
    assert_eq!(search.state(8000), SegmentState::Discovered);

    let summary = search.ledger.snapshot();
    let video = summary.representation("v1").unwrap();
    let missing: Vec<u64> = video.missing_segments.iter().map(|m| m.index).collect();
    assert_eq!(missing, vec![10_000]);
    Ok(())
}

#[tokio::test]
async fn test_forward_time_search_from_publish_frame_time() -> anyhow::Result<()> {
    let search = Search::timed();
    let probe = Arc::new(ScriptedProbe::new(|time| {
        if time >= 4000 && time % 2000 == 0 && time != 16_000 {
            ProbeOutcome::Present
        } else {
            ProbeOutcome::Absent
        }
    }));
    let config = SearchConfig {
        direction: SearchDirection::Forward,
        ..config(500, 30_000)
    };

    let (report, queued) = search
        .run_seeded(
            &probe,
            DiscoveryWindow::new(20_000, 22_000),
            config,
            Some(4000),
        )
        .await?;

    assert_eq!(report.end, SearchEnd::ReachedLiveWindow);
    assert_eq!(report.discovered, 7);
    assert_eq!(report.missing, 1);
    assert_eq!(report.oldest, 4000);
    assert_eq!(queued, vec![4000, 6000, 8000, 10_000, 12_000, 14_000, 18_000]);
    assert_eq!(report.probed, 500 + 5 + 1001 + 1500 + 500);
    assert_eq!(search.state(16_000), SegmentState::Missing);
    assert_eq!(search.state(2000), SegmentState::Unknown);
    Ok(())
}

#[tokio::test]
async fn test_time_search_without_duration_walks_every_tick() -> anyhow::Result<()> {
    let search = Search::new(
        Representation {
            segment_duration: None,
            ..timed_representation("v1")
        },
        Arc::new(TimeConvention),
    );
    let probe = Arc::new(ScriptedProbe::new(|time| {
        if time >= 4000 && time % 2000 == 0 {
            ProbeOutcome::Present
        } else {
            ProbeOutcome::Absent
        }
    }));

    let (report, queued) = search
        .run(
            &probe,
            DiscoveryWindow::new(10_000, 12_000),
            config(500, 30_000),
        )
        .await?;

    assert_eq!(report.end, SearchEnd::IndexSpaceExhausted);
    assert_eq!(report.probed, 10_000);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.missing, 0);
    assert_eq!(queued, vec![8000, 6000, 4000]);
    assert_eq!(search.state(5000), SegmentState::ProbedAbsent);
    Ok(())
}

#[tokio::test]
async fn test_unresolved_probe_is_never_absent() -> anyhow::Result<()> {
    let search = Search::numbered();
    let probe = Arc::new(ScriptedProbe::new(|index| match index {
        10 => ProbeOutcome::Indeterminate,
        12 | 13 => ProbeOutcome::Absent,
        _ => ProbeOutcome::Present,
    }));

    let config = SearchConfig {
        check_attempts: 2,
        ..config(500, 30_000)
    };
    let (report, _) = search
        .run(&probe, DiscoveryWindow::new(20, 25), config)
        .await?;

    assert_eq!(report.unresolved, 1);
    assert_eq!(report.missing, 3);
    assert_eq!(report.discovered, 17);
    assert_eq!(probe.checks_of(10), 2);
    assert_eq!(probe.checks_of(11), 1);
    assert_eq!(search.state(10), SegmentState::Missing);
    assert_eq!(search.state(12), SegmentState::Missing);
    Ok(())
}

#[tokio::test]
async fn test_rerun_does_not_change_ledger() -> anyhow::Result<()> {
    let search = Search::numbered();
    let probe = Arc::new(ScriptedProbe::new(|index| {
        if index == 7 {
            ProbeOutcome::Absent
        } else {
            ProbeOutcome::Present
        }
    }));
    let window = DiscoveryWindow::new(20, 25);

    let (first, queued) = search.run(&probe, window, config(4, 30_000)).await?;
    assert_eq!(first.discovered, 19);
    assert_eq!(first.missing, 1);
    assert_eq!(queued.len(), 19);
    let summary = search.ledger.snapshot();

    let (second, queued) = search.run(&probe, window, config(4, 30_000)).await?;
    assert_eq!(second.discovered, 0);
    assert_eq!(second.missing, 0);
    assert!(queued.is_empty());
    assert_eq!(search.ledger.snapshot(), summary);
    Ok(())
}

#[tokio::test]
async fn test_forward_search_from_broadcast_start() -> anyhow::Result<()> {
    let search = Search::numbered();
    let probe = Arc::new(ScriptedProbe::new(|index| {
        if index < 5 || index == 10 {
            ProbeOutcome::Absent
        } else {
            ProbeOutcome::Present
        }
    }));
    let config = SearchConfig {
        direction: SearchDirection::Forward,
        ..config(500, 30_000)
    };

    let (report, queued) = search
        .run(&probe, DiscoveryWindow::new(20, 25), config)
        .await?;

    assert_eq!(report.end, SearchEnd::ReachedLiveWindow);
    assert_eq!(report.discovered, 14);
    assert_eq!(report.missing, 1);
    assert_eq!(report.oldest, 5);
    assert_eq!(queued.first(), Some(&5));
    assert_eq!(queued.last(), Some(&19));

    // before the first segment of the broadcast, not a gap inside it
    assert_eq!(search.state(4), SegmentState::ProbedAbsent);
    assert_eq!(search.state(10), SegmentState::Missing);
    Ok(())
}

#[tokio::test]
async fn test_probes_share_concurrency_limit() -> anyhow::Result<()> {
    let mut search = Search::numbered();
    search.permits = Arc::new(Semaphore::new(3));
    let probe = Arc::new(ScriptedProbe::new(|_| ProbeOutcome::Present));

    let (report, _) = search
        .run(&probe, DiscoveryWindow::new(200, 210), config(50, 30_000))
        .await?;

    assert_eq!(report.discovered, 200);
    assert!(probe.max_in_flight() <= 3);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start() -> anyhow::Result<()> {
    let search = Search::numbered();
    search.token.cancel();
    let probe = Arc::new(ScriptedProbe::new(|_| ProbeOutcome::Present));

    let (report, queued) = search
        .run(&probe, DiscoveryWindow::new(200, 210), config(50, 30_000))
        .await?;

    assert_eq!(report.end, SearchEnd::Cancelled);
    assert_eq!(report.probed, 0);
    assert!(queued.is_empty());
    Ok(())
}
