use std::path::PathBuf;

use super::Merger;
use crate::{error::KaikoResult, recorder::Recording};

pub struct SkipMerger;

impl Merger for SkipMerger {
    async fn merge(&mut self, recording: &Recording) -> KaikoResult<Option<PathBuf>> {
        log::info!("Skip merging. Please merge video chunks manually.");
        log::info!(
            "Temporary files are located at {}",
            recording.storage.location_hint()
        );
        Ok(None)
    }
}
