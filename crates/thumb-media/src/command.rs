//! External tool invocation: an ffmpeg argument builder and a runner with
//! deadline enforcement.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Builder for ffmpeg arguments.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed before -i
    input_args: Vec<String>,
    /// Arguments placed after -i
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Seek before decoding. Zero is omitted.
    pub fn seek(self, seconds: f64) -> Self {
        if seconds > 0.0 {
            self.input_arg("-ss").input_arg(format!("{}", seconds))
        } else {
            self
        }
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Emit exactly one frame.
    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
        ];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs external tools with an optional per-call deadline.
///
/// Children are spawned with `kill_on_drop`, so a cancelled caller never
/// leaves a renderer process behind.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner {
    timeout: Option<Duration>,
}

impl ToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run `program` and return its captured output on success.
    pub async fn run(&self, program: &str, args: &[String]) -> MediaResult<Output> {
        check_tool(program)?;
        debug!("Running {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("{} timed out after {:?}, killing process", program, limit);
                    return Err(MediaError::Timeout(limit));
                }
            },
            None => child.wait_with_output().await?,
        };

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(MediaError::command_failed(
                program,
                "exited with non-zero status",
                (!stderr.is_empty()).then_some(stderr),
                output.status.code(),
            ))
        }
    }

    pub async fn run_ffmpeg(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.run("ffmpeg", &cmd.build_args()).await.map(|_| ())
    }
}

/// Resolve a tool on PATH.
pub fn check_tool(program: &str) -> MediaResult<PathBuf> {
    which::which(program).map_err(|_| MediaError::ToolNotFound(program.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_args_order() {
        let cmd = FfmpegCommand::new("in.mp4", "out.jpg")
            .seek(5.0)
            .video_filter("thumbnail,scale=150:100")
            .single_frame()
            .output_arg("-q:v")
            .output_arg("2");
        let args = cmd.build_args();

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert!(ss < input && input < vf);
        assert_eq!(args[ss + 1], "5");
        assert_eq!(args.last().map(String::as_str), Some("out.jpg"));
        assert_eq!(args[0], "-y");
    }

    #[test]
    fn test_zero_seek_omitted() {
        let args = FfmpegCommand::new("a", "b").seek(0.0).build_args();
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let err = ToolRunner::new()
            .run("definitely-not-a-real-tool-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_hung_tool_is_killed_at_deadline() {
        let limit = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = ToolRunner::new()
            .with_timeout(limit)
            .run("sleep", &["5".to_string()])
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(err.to_string(), "Operation timed out after 200ms");
        assert!(matches!(err, MediaError::Timeout(reported) if reported == limit));
    }
}
