//! Pipeline descriptions and the stock presets.

use std::fmt;
use std::path::Path;

use crate::error::PipelineError;

/// Longest supported chain.
pub const MAX_STAGES: usize = 2;

/// What a stage does in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Produces media (camera capture).
    Producer,
    /// Moves media between a stream and a pipe (muxer, RTSP server).
    Transport,
    /// Displays media.
    Consumer,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => write!(f, "producer"),
            Self::Transport => write!(f, "transport"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

/// One external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub role: StageRole,
    pub program: String,
    pub args: Vec<String>,
    /// Launch `program args...` as one command line through the
    /// platform shell instead of executing `program` directly.
    pub shell: bool,
    /// Arguments for the availability probe; `None` skips probing.
    pub probe: Option<Vec<String>>,
}

impl StageSpec {
    /// A directly executed stage probed with `-version`.
    pub fn new<I, S>(role: StageRole, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            shell: false,
            probe: Some(vec!["-version".to_string()]),
        }
    }

    pub fn via_shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn with_probe<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.probe = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.probe = None;
        self
    }

    /// `program arg arg ...`, as logged and as handed to the shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Capture settings for [`PipelineSpec::camera_rtsp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Bits per second.
    pub bitrate: u32,
    /// Frames between keyframes.
    pub keyframe_interval: u32,
    pub rtsp_port: u16,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: 2_000_000,
            keyframe_interval: 30,
            rtsp_port: 8554,
        }
    }
}

impl CameraSettings {
    /// The URL clients use, with `host` substituted for the bind address.
    pub fn rtsp_url(&self, host: &str) -> String {
        format!("rtsp://{host}:{}/stream", self.rtsp_port)
    }
}

/// An ordered chain of 1 to [`MAX_STAGES`] stages; each stage's stdout
/// feeds the next stage's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidSpec("pipeline has no stages"));
        }
        if self.stages.len() > MAX_STAGES {
            return Err(PipelineError::InvalidSpec("pipeline has more than two stages"));
        }
        if self.stages.iter().any(|s| s.program.trim().is_empty()) {
            return Err(PipelineError::InvalidSpec("stage program is empty"));
        }
        Ok(())
    }

    // ── Presets ──────────────────────────────────────────────────

    /// Camera capture piped into an RTSP server.
    pub fn camera_rtsp(camera: CameraSettings) -> Self {
        let capture = StageSpec::new(
            StageRole::Producer,
            "rpicam-vid",
            [
                "-t".to_string(),
                "0".into(),
                "--width".into(),
                camera.width.to_string(),
                "--height".into(),
                camera.height.to_string(),
                "--framerate".into(),
                camera.framerate.to_string(),
                "--codec".into(),
                "h264".into(),
                "--profile".into(),
                "baseline".into(),
                "--bitrate".into(),
                camera.bitrate.to_string(),
                "--keyframe".into(),
                camera.keyframe_interval.to_string(),
                "--flush".into(),
                "--output".into(),
                "-".into(),
            ],
        )
        .with_probe(["--version"]);

        let server = StageSpec::new(
            StageRole::Transport,
            "ffmpeg",
            [
                "-re".to_string(),
                "-i".into(),
                "-".into(),
                "-c:v".into(),
                "copy".into(),
                "-f".into(),
                "rtsp".into(),
                "-rtsp_transport".into(),
                "tcp".into(),
                camera.rtsp_url("0.0.0.0"),
            ],
        );

        Self::new("camera-rtsp", vec![capture, server])
    }

    /// Low-latency display of a remote stream.
    pub fn playback(source: &str) -> Self {
        let player = StageSpec::new(
            StageRole::Consumer,
            "ffplay",
            [
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-framedrop",
                "-rtsp_transport",
                "tcp",
                source,
            ],
        );
        Self::new("playback", vec![player])
    }

    /// Copy a remote stream to `path` while displaying it.
    ///
    /// The muxer runs through the shell so the tee target list is
    /// passed as a single quoted argument.
    pub fn record_and_playback(source: &str, path: &Path) -> Self {
        let tee = format!("\"{}|[f=nut]pipe:1\"", path.display());
        let muxer = StageSpec::new(
            StageRole::Transport,
            "ffmpeg",
            ["-i", source, "-c", "copy", "-map", "0", "-f", "tee", tee.as_str()],
        )
        .via_shell();

        let player = StageSpec::new(
            StageRole::Consumer,
            "ffplay",
            [
                "-i",
                "pipe:0",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-framedrop",
            ],
        );
        Self::new("record-and-playback", vec![muxer, player])
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(PipelineSpec::new("empty", vec![]).validate().is_err());

        let s = StageSpec::new(StageRole::Consumer, "ffplay", ["x"]);
        assert!(PipelineSpec::new("three", vec![s.clone(), s.clone(), s.clone()])
            .validate()
            .is_err());

        let blank = StageSpec::new(StageRole::Consumer, "  ", Vec::<String>::new());
        let err = PipelineSpec::new("blank", vec![blank]).validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);

        assert!(PipelineSpec::new("ok", vec![s]).validate().is_ok());
    }

    #[test]
    fn camera_preset() {
        let spec = PipelineSpec::camera_rtsp(CameraSettings::default());
        spec.validate().unwrap();
        assert_eq!(spec.stages[0].role, StageRole::Producer);
        assert_eq!(spec.stages[0].probe, Some(vec!["--version".to_string()]));
        assert_eq!(
            spec.stages[0].command_line(),
            "rpicam-vid -t 0 --width 1920 --height 1080 --framerate 30 --codec h264 \
             --profile baseline --bitrate 2000000 --keyframe 30 --flush --output -"
        );
        assert_eq!(
            spec.stages[1].args.last().map(String::as_str),
            Some("rtsp://0.0.0.0:8554/stream")
        );
    }

    #[test]
    fn playback_preset() {
        let spec = PipelineSpec::playback("rtsp://192.168.1.20:8554/stream");
        assert_eq!(spec.stages.len(), 1);
        assert!(!spec.stages[0].shell);
        assert_eq!(
            spec.stages[0].command_line(),
            "ffplay -fflags nobuffer -flags low_delay -framedrop -rtsp_transport tcp \
             rtsp://192.168.1.20:8554/stream"
        );
    }

    #[test]
    fn record_preset_uses_shell_for_tee() {
        let spec = PipelineSpec::record_and_playback(
            "rtsp://cam:8554/stream",
            Path::new("/tmp/out.mkv"),
        );
        assert!(spec.stages[0].shell);
        assert!(spec.stages[0]
            .command_line()
            .ends_with("-f tee \"/tmp/out.mkv|[f=nut]pipe:1\""));
        assert_eq!(spec.stages[1].args[..2], ["-i", "pipe:0"]);
    }
}
