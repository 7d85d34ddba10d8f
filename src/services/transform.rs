//! The transform capability: an external program that resizes an image read
//! from stdin and writes the result to stdout.

use async_trait::async_trait;
use std::{
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Command,
};
use tracing::debug;

/// ImageMagick's classic entry point.
pub const DEFAULT_PROGRAM: &str = "convert";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("stream error while piping through `{program}`: {source}")]
    Stream {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Resizes an image stream to a target width.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Read the source image from `input` and write the resized image to
    /// `output`. Returns the number of bytes written.
    async fn transform(
        &self,
        input: &mut (dyn AsyncRead + Send + Unpin),
        width: u32,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransformError>;

    /// Check that the transform can run at all.
    async fn probe(&self) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Arguments for `<program> - -resize <width>x -`.
pub fn resize_args(width: u32) -> [String; 4] {
    [
        "-".to_string(),
        "-resize".to_string(),
        format!("{}x", width),
        "-".to_string(),
    ]
}

/// Runs ImageMagick (or a compatible program) as a subprocess.
///
/// The child is killed if the deadline passes or the caller goes away.
#[derive(Clone, Debug)]
pub struct ConvertTransformer {
    program: String,
    timeout: Duration,
}

impl ConvertTransformer {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn stream_error(&self, source: io::Error) -> TransformError {
        TransformError::Stream {
            program: self.program.clone(),
            source,
        }
    }
}

impl Default for ConvertTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl Transformer for ConvertTransformer {
    async fn transform(
        &self,
        input: &mut (dyn AsyncRead + Send + Unpin),
        width: u32,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransformError> {
        let mut child = Command::new(&self.program)
            .args(resize_args(width))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child pipe not captured");
        let mut stdin = child.stdin.take().ok_or_else(|| self.stream_error(missing()))?;
        let mut stdout = child.stdout.take().ok_or_else(|| self.stream_error(missing()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| self.stream_error(missing()))?;

        let run = async {
            let feed = async {
                let copied = tokio::io::copy(input, &mut stdin).await;
                let closed = stdin.shutdown().await;
                drop(stdin);
                copied.and_then(|n| closed.map(|_| n))
            };
            let drain = async {
                let copied = tokio::io::copy(&mut stdout, &mut *output).await?;
                output.flush().await?;
                Ok::<_, io::Error>(copied)
            };
            let diagnostics = async {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await.map(|_| buf)
            };

            let (fed, written, diagnostics) = tokio::join!(feed, drain, diagnostics);
            let status = child.wait().await;
            (fed, written, diagnostics, status)
        };

        let (fed, written, diagnostics, status) =
            match tokio::time::timeout(self.timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(TransformError::TimedOut {
                        program: self.program.clone(),
                        timeout: self.timeout,
                    });
                }
            };

        let status = status.map_err(|err| self.stream_error(err))?;
        if !status.success() {
            let stderr = diagnostics
                .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
                .unwrap_or_default();
            return Err(TransformError::Failed {
                program: self.program.clone(),
                status,
                stderr,
            });
        }

        let fed = fed.map_err(|err| self.stream_error(err))?;
        let written = written.map_err(|err| self.stream_error(err))?;
        debug!(
            program = %self.program,
            width,
            bytes_in = fed,
            bytes_out = written,
            "transform finished"
        );
        Ok(written)
    }

    /// Runs `<program> -version`.
    async fn probe(&self) -> Result<(), TransformError> {
        let output = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| TransformError::TimedOut {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| TransformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransformError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
