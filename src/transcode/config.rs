//! Transcoder configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::{SessionKey, Variant};

/// How the transcoder is launched and supervised
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Transcoder executable
    pub program: PathBuf,

    /// Root directory for segment output (one subdirectory per camera)
    pub segment_root: PathBuf,

    /// Index file written into each camera's segment directory
    pub index_name: String,

    /// Target segment duration in seconds
    pub segment_seconds: u32,

    /// Number of segments kept in the rolling index
    pub playlist_size: u32,

    /// Output arguments for the live-socket variant (written to stdout)
    pub live_output_args: Vec<String>,

    /// Output arguments for the segmented variant, before the HLS options
    pub segmented_output_args: Vec<String>,

    /// How long to wait for a graceful exit before killing
    pub stop_timeout: Duration,

    /// Read size for the stdout reader
    pub read_chunk_size: usize,

    /// How often to look for the segment index while starting
    pub index_poll_interval: Duration,

    /// Stderr lines kept as the diagnostic of a failed process
    pub diagnostic_lines: usize,

    /// Remove a camera's segment directory after its session ends
    pub remove_segments_on_stop: bool,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            segment_root: PathBuf::from("./hls_output"),
            index_name: "index.m3u8".to_string(),
            segment_seconds: 2,
            playlist_size: 6,
            live_output_args: to_args(&[
                "-f", "mpegts", "-codec:v", "mpeg1video", "-b:v", "1000k", "-bf", "0", "-codec:a",
                "mp2", "-b:a", "128k",
            ]),
            segmented_output_args: to_args(&["-c:v", "copy", "-c:a", "aac"]),
            stop_timeout: Duration::from_secs(5),
            read_chunk_size: 32 * 1024,
            index_poll_interval: Duration::from_millis(250),
            diagnostic_lines: 20,
            remove_segments_on_stop: true,
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Where a launched process writes its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Continuous stream on stdout
    Stdout,
    /// Segment files and an index in a directory
    Directory { dir: PathBuf, index: PathBuf },
}

/// A fully resolved transcoder invocation
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    pub key: SessionKey,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: OutputTarget,
}

impl TranscodeConfig {
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn segment_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.segment_root = root.into();
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Segment directory of a camera
    pub fn segment_dir(&self, key: &SessionKey) -> PathBuf {
        self.segment_root.join(key.camera.to_string())
    }

    /// Build the command line for a session
    pub fn command(&self, key: SessionKey, source_url: &str) -> TranscodeCommand {
        let mut args = to_args(&["-hide_banner", "-loglevel", "error", "-nostats"]);
        if source_url.starts_with("rtsp://") || source_url.starts_with("rtsps://") {
            args.extend(to_args(&["-rtsp_transport", "tcp"]));
        }
        args.push("-i".to_string());
        args.push(source_url.to_string());

        let output = match key.variant {
            Variant::LiveSocket => {
                args.extend(self.live_output_args.iter().cloned());
                args.push("pipe:1".to_string());
                OutputTarget::Stdout
            }
            Variant::Segmented => {
                let dir = self.segment_dir(&key);
                let index = dir.join(&self.index_name);
                args.extend(self.segmented_output_args.iter().cloned());
                args.extend(to_args(&["-f", "hls"]));
                args.push("-hls_time".to_string());
                args.push(self.segment_seconds.to_string());
                args.push("-hls_list_size".to_string());
                args.push(self.playlist_size.to_string());
                args.extend(to_args(&["-hls_flags", "delete_segments"]));
                args.push("-hls_segment_filename".to_string());
                args.push(path_arg(&dir.join("segment_%05d.ts")));
                args.push(path_arg(&index));
                OutputTarget::Directory { dir, index }
            }
        };

        TranscodeCommand {
            key,
            program: self.program.clone(),
            args,
            output,
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TranscodeConfig::default();

        assert_eq!(config.program, PathBuf::from("ffmpeg"));
        assert_eq!(config.index_name, "index.m3u8");
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert!(config.remove_segments_on_stop);
    }

    #[test]
    fn test_live_command_writes_stdout() {
        let config = TranscodeConfig::default();
        let cmd = config.command(SessionKey::live(7u32), "rtsp://cam7/stream");

        assert_eq!(cmd.output, OutputTarget::Stdout);
        assert_eq!(cmd.args.last().map(String::as_str), Some("pipe:1"));
        let i = cmd.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(cmd.args[i + 1], "rtsp://cam7/stream");
        assert!(cmd.args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[test]
    fn test_segmented_command_writes_directory() {
        let config = TranscodeConfig::default().segment_root("/tmp/segments");
        let cmd = config.command(SessionKey::segmented(3u32), "http://cam3/video.mjpg");

        let dir = PathBuf::from("/tmp/segments/3");
        assert_eq!(
            cmd.output,
            OutputTarget::Directory {
                dir: dir.clone(),
                index: dir.join("index.m3u8"),
            }
        );
        assert!(!cmd.args.iter().any(|a| a == "-rtsp_transport"));
        assert!(cmd.args.iter().any(|a| a == "hls"));
        assert_eq!(
            cmd.args.last().map(String::as_str),
            Some(dir.join("index.m3u8").to_string_lossy().as_ref())
        );
    }
}
