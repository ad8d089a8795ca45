use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use tokio::{fs::File, io::AsyncWriteExt, process::Command};

use super::Merger;
use crate::{
    dash::TrackKind,
    error::{KaikoError, KaikoResult},
    ledger::MergeTrack,
    recorder::Recording,
};

/// Concatenates every track into one fragmented file, then muxes them with the ffmpeg CLI.
pub struct FfmpegMerger {
    /// Final output file path.
    output_file: PathBuf,
    /// Keep downloaded segments after merging.
    keep_segments: bool,
    ffmpeg: Option<PathBuf>,
    extra_args: Option<String>,
}

impl FfmpegMerger {
    pub fn new(output_file: PathBuf, keep_segments: bool) -> Self {
        Self {
            output_file,
            keep_segments,
            ffmpeg: None,
            extra_args: None,
        }
    }

    /// Uses `path` instead of looking up `ffmpeg` in `PATH`.
    pub fn with_ffmpeg(mut self, path: Option<PathBuf>) -> Self {
        self.ffmpeg = path;
        self
    }

    /// Shell-style arguments inserted before the output file.
    pub fn with_extra_args(mut self, args: Option<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn ffmpeg(&self) -> KaikoResult<PathBuf> {
        match &self.ffmpeg {
            Some(path) => Ok(path.clone()),
            None => Ok(which::which("ffmpeg")?),
        }
    }

    fn arguments(&self, video: &Path, audio: Option<&Path>) -> KaikoResult<Vec<OsString>> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(video.into());
        if let Some(audio) = audio {
            args.push("-i".into());
            args.push(audio.into());
        }
        args.extend(["-c", "copy"].map(OsString::from));

        let is_mp4 = self
            .output_file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
        if is_mp4 {
            args.extend(["-movflags", "+faststart"].map(OsString::from));
        }

        if let Some(extra) = &self.extra_args {
            let extra = shlex::split(extra).ok_or_else(|| {
                KaikoError::MergeError(format!("invalid extra ffmpeg arguments: {extra}"))
            })?;
            args.extend(extra.into_iter().map(OsString::from));
        }

        args.push("-y".into());
        args.push(self.output_file.clone().into());
        Ok(args)
    }
}

impl Merger for FfmpegMerger {
    async fn merge(&mut self, recording: &Recording) -> KaikoResult<Option<PathBuf>> {
        log::info!("Merging chunks...");

        let root = recording.storage.root();
        let Some(video) = recording.track(TrackKind::Video) else {
            return Err(KaikoError::MergeError("no video track recorded".to_string()));
        };
        let Some(video) = concat_track(video, root).await? else {
            return Err(KaikoError::MergeError("no video segment downloaded".to_string()));
        };
        let audio = match recording.track(TrackKind::Audio) {
            Some(audio) => concat_track(audio, root).await?,
            None => None,
        };

        let ffmpeg = self.ffmpeg()?;
        let args = self.arguments(&video, audio.as_deref())?;
        log::debug!(
            "Running {} {}",
            ffmpeg.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let output = Command::new(&ffmpeg).args(&args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!("ffmpeg exited with {}: {}", output.status, stderr.trim());
            log::warn!(
                "You can find the downloaded segments at {}",
                recording.storage.location_hint()
            );
            return Err(KaikoError::MergeError(format!(
                "ffmpeg exited with {}",
                output.status
            )));
        }

        if !self.keep_segments {
            log::info!("End of merging.");
            log::info!("Starting cleaning temporary files.");
            recording.storage.clear().await?;
        }

        log::info!(
            "All finished. Please checkout your files at {}",
            self.output_file.display()
        );
        Ok(Some(self.output_file.clone()))
    }
}

/// Writes the init segment followed by every downloaded segment of `track` into
/// `<root>/<kind>_full.mp4`. Returns `None` when there is nothing to write.
async fn concat_track(track: &MergeTrack, root: &Path) -> KaikoResult<Option<PathBuf>> {
    if track.segment_paths().next().is_none() {
        log::warn!("No segment of {} was downloaded.", track.representation.id);
        return Ok(None);
    }

    let gaps = track.gaps();
    if gaps > 0 {
        log::warn!(
            "{gaps} segment(s) of {} are missing, the output will skip over them.",
            track.representation.id
        );
    }

    let path = root.join(format!("{}_full.mp4", track.kind()));
    let mut output = File::create(&path).await?;
    let inputs = track.init.as_deref().into_iter().chain(track.segment_paths());
    for input in inputs {
        let mut file = File::open(input).await?;
        tokio::io::copy(&mut file, &mut output).await?;
    }
    output.flush().await?;

    log::info!(
        "Concatenated {} into {}",
        track.representation.id,
        path.display()
    );
    Ok(Some(path))
}
