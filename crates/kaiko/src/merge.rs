mod ffmpeg;
mod skip;

pub use ffmpeg::FfmpegMerger;
pub use skip::SkipMerger;

use std::{future::Future, path::PathBuf};

use crate::{error::KaikoResult, recorder::Recording};

pub trait Merger {
    /// Turns the segments of a finished recording into its final output.
    ///
    /// Returns the path of the produced file, if any.
    fn merge(
        &mut self,
        recording: &Recording,
    ) -> impl Future<Output = KaikoResult<Option<PathBuf>>> + Send;
}

pub enum KaikoMerger {
    Ffmpeg(FfmpegMerger),
    Skip(SkipMerger),
}

impl KaikoMerger {
    pub fn ffmpeg(output_file: PathBuf, keep_segments: bool) -> Self {
        Self::Ffmpeg(FfmpegMerger::new(output_file, keep_segments))
    }

    pub fn skip() -> Self {
        Self::Skip(SkipMerger)
    }
}

impl Merger for KaikoMerger {
    async fn merge(&mut self, recording: &Recording) -> KaikoResult<Option<PathBuf>> {
        match self {
            Self::Ffmpeg(merger) => merger.merge(recording).await,
            Self::Skip(merger) => merger.merge(recording).await,
        }
    }
}
