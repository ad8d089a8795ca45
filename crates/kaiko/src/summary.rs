use std::{fmt::Write as _, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{dash::TrackKind, error::KaikoResult, util::format_duration};

/// Read-only account of a run, produced by the ledger.
///
/// It carries no wall clock time, so the same ledger state always yields the same summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub representations: Vec<RepresentationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentationSummary {
    pub representation: String,
    pub kind: TrackKind,
    pub convention: String,
    pub downloaded: u64,
    pub missing: u64,
    pub failed: u64,
    /// Discovered but never finished. Zero once the run is finalized.
    pub pending: u64,
    pub probed_absent: u64,
    pub first_index: Option<u64>,
    pub last_index: Option<u64>,
    /// Presentation time of the first segment, in seconds.
    pub first_timestamp: Option<f64>,
    /// Seconds between the start of the first and the end of the last segment.
    pub estimated_duration: f64,
    pub missing_segments: Vec<MissingSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingSegment {
    pub index: u64,
    /// Presentation time in seconds.
    pub timestamp: f64,
}

impl RepresentationSummary {
    pub fn new(representation: &str, kind: TrackKind, convention: &str) -> Self {
        Self {
            representation: representation.to_string(),
            kind,
            convention: convention.to_string(),
            downloaded: 0,
            missing: 0,
            failed: 0,
            pending: 0,
            probed_absent: 0,
            first_index: None,
            last_index: None,
            first_timestamp: None,
            estimated_duration: 0.,
            missing_segments: Vec::new(),
        }
    }

    /// Segments the run knows about, captured or not.
    pub fn total(&self) -> u64 {
        self.downloaded + self.missing + self.failed + self.pending
    }

    pub fn loss_percentage(&self) -> f64 {
        match self.total() {
            0 => 0.,
            total => (self.total() - self.downloaded) as f64 / total as f64 * 100.,
        }
    }
}

impl Summary {
    pub fn representation(&self, id: &str) -> Option<&RepresentationSummary> {
        self.representations.iter().find(|r| r.representation == id)
    }

    pub fn total_missing(&self) -> u64 {
        self.representations.iter().map(|r| r.missing).sum()
    }

    pub fn is_lossless(&self) -> bool {
        self.representations
            .iter()
            .all(|r| r.downloaded == r.total())
    }

    /// Human readable report, one block per representation.
    pub fn render_report(&self, title: &str, file_size: u64, language: ReportLanguage) -> String {
        let labels = language.labels();
        let mut report = String::new();

        let duration = self
            .representations
            .iter()
            .find(|r| r.kind == TrackKind::Video)
            .or_else(|| self.representations.first())
            .map(|r| r.estimated_duration)
            .unwrap_or_default();
        let file_size = group_thousands(file_size);

        _ = writeln!(report, "* {title}");
        _ = writeln!(
            report,
            "- {} : {file_size}/{file_size} (100.00%)",
            labels.file_size
        );
        _ = writeln!(
            report,
            "- {} : {}",
            labels.duration,
            format_duration(Duration::from_secs_f64(duration.max(0.)))
        );

        for representation in &self.representations {
            _ = writeln!(
                report,
                "\n[{} {}]",
                representation.kind, representation.representation
            );

            let total = representation.total();
            if total == 0 {
                _ = writeln!(report, "- {} : 0 ~ 0 (0)", labels.segments);
                continue;
            }

            let first = representation
                .first_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "N/A".to_string());
            let last = representation
                .last_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "N/A".to_string());
            let missing: Vec<_> = representation
                .missing_segments
                .iter()
                .map(|m| m.index.to_string())
                .collect();

            _ = writeln!(report, "- {} : {first}", labels.first_ts);
            _ = writeln!(report, "- {} : {first} ~ {last} ({total})", labels.segments);
            _ = writeln!(
                report,
                "- {} : {}/{total} ({:.2}%)",
                labels.loss,
                total - representation.downloaded,
                representation.loss_percentage()
            );
            _ = writeln!(report, "- {} : [{}]", labels.missing, missing.join(", "));
        }

        report
    }

    pub async fn write_report<P>(
        &self,
        path: P,
        title: &str,
        file_size: u64,
        language: ReportLanguage,
    ) -> KaikoResult<()>
    where
        P: AsRef<Path>,
    {
        tracing::info!("Writing summary to {}", path.as_ref().display());
        tokio::fs::write(path, self.render_report(title, file_size, language)).await?;
        Ok(())
    }

    pub async fn write_json<P>(&self, path: P) -> KaikoResult<()>
    where
        P: AsRef<Path>,
    {
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportLanguage {
    #[default]
    English,
    Korean,
}

struct Labels {
    file_size: &'static str,
    duration: &'static str,
    first_ts: &'static str,
    segments: &'static str,
    loss: &'static str,
    missing: &'static str,
}

impl ReportLanguage {
    fn labels(&self) -> Labels {
        match self {
            Self::English => Labels {
                file_size: "File Size",
                duration: "Duration",
                first_ts: "First Segment TS",
                segments: "Total Segments",
                loss: "Loss",
                missing: "Missing Segments",
            },
            Self::Korean => Labels {
                file_size: "로딩완료",
                duration: "추정길이",
                first_ts: "최초시간",
                segments: "세그먼트",
                loss: "손실률",
                missing: "손실값",
            },
        }
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}
