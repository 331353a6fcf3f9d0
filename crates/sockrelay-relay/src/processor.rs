use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ProcessingError;

/// Default transcoding program.
pub const DEFAULT_PROGRAM: &str = "ffmpeg";

/// Default video codec passed to the transcoder.
pub const DEFAULT_VIDEO_CODEC: &str = "libx265";

/// Extension appended to the source path to form the output path.
pub const OUTPUT_SUFFIX: &str = ".mp4";

/// Stderr bytes kept from a failed run.
const STDERR_TAIL: usize = 2048;

/// The processing step applied to every work packet.
///
/// Implementations run on worker threads, never on the dispatch thread.
pub trait Processor: Send + Sync + 'static {
    /// Output path a run for `source` produces (or would have produced).
    fn output_path(&self, source: &Path) -> PathBuf {
        default_output_path(source)
    }

    /// Process `source`, returning the output path on success.
    fn process(&self, source: &Path) -> Result<PathBuf, ProcessingError>;
}

impl<F> Processor for F
where
    F: Fn(&Path) -> Result<PathBuf, ProcessingError> + Send + Sync + 'static,
{
    fn process(&self, source: &Path) -> Result<PathBuf, ProcessingError> {
        self(source)
    }
}

/// `<source>.mp4`, appended to the whole path rather than replacing the extension.
pub fn default_output_path(source: &Path) -> PathBuf {
    let mut out = OsString::from(source.as_os_str());
    out.push(OUTPUT_SUFFIX);
    PathBuf::from(out)
}

/// Runs an external transcoder: `<program> -i <source> -c:v <codec> <output> -y`.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: PathBuf,
    video_codec: String,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
        }
    }
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the program (absolute path or name looked up on `PATH`).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Override the video codec.
    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = codec.into();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, source: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(source)
            .arg("-c:v")
            .arg(&self.video_codec)
            .arg(output)
            .arg("-y")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl Processor for CommandProcessor {
    fn process(&self, source: &Path) -> Result<PathBuf, ProcessingError> {
        let output_path = self.output_path(source);
        debug!(
            program = %self.program.display(),
            source = %source.display(),
            output = %output_path.display(),
            "running processor"
        );

        let output = self
            .command(source, &output_path)
            .output()
            .map_err(|source| ProcessingError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(output_path);
        }
        Err(ProcessingError::Failed {
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
