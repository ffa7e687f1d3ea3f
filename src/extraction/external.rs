//! External-process engine: write the document to a private temp dir and run `pdftotext`.

use super::{EngineKind, ExtractionError, TextExtractor, duration_ms, normalize_text};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const KIND: EngineKind = EngineKind::External;
const PAGE_BREAK: char = '\x0c';
const STDERR_EXCERPT: usize = 240;

/// Runs the poppler `pdftotext` tool on a temporary copy of the document.
pub struct PdftotextEngine {
    program: PathBuf,
    timeout: Duration,
    check_timeout: Duration,
    max_pages: Option<usize>,
}

impl PdftotextEngine {
    /// Engine invoking `program`, bounded by `timeout` per extraction and `check_timeout`
    /// per availability check.
    pub fn new(
        program: PathBuf,
        timeout: Duration,
        check_timeout: Duration,
        max_pages: Option<usize>,
    ) -> Self {
        Self {
            program,
            timeout,
            check_timeout,
            max_pages,
        }
    }

    fn command(&self, input: &std::path::Path) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("-enc").arg("UTF-8");
        if let Some(max_pages) = self.max_pages {
            command.arg("-l").arg(max_pages.to_string());
        }
        command
            .arg(input)
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

enum Interrupt {
    Timeout,
    Cancelled,
}

#[async_trait]
impl TextExtractor for PdftotextEngine {
    fn kind(&self) -> EngineKind {
        KIND
    }

    /// Any exit within the check timeout counts as invocable; some builds exit non-zero for `-v`.
    async fn check_available(&self) -> Result<(), String> {
        let mut child = Command::new(&self.program)
            .arg("-v")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| format!("cannot spawn {}: {error}", self.program.display()))?;

        match tokio::time::timeout(self.check_timeout, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(format!("{} did not run: {error}", self.program.display())),
            Err(_) => {
                terminate(&mut child).await;
                Err(format!(
                    "{} did not answer within {} ms",
                    self.program.display(),
                    duration_ms(self.check_timeout)
                ))
            }
        }
    }

    async fn extract(
        &self,
        document: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, ExtractionError> {
        // Removed on every return path, panics included.
        let workdir = tempfile::Builder::new()
            .prefix("resume-intake-")
            .tempdir()
            .map_err(|error| ExtractionError::engine(KIND, format!("temp dir: {error}")))?;
        let input = workdir.path().join("document.pdf");
        tokio::fs::write(&input, document)
            .await
            .map_err(|error| ExtractionError::engine(KIND, format!("write temp file: {error}")))?;

        let mut child = self.command(&input).spawn().map_err(|error| {
            ExtractionError::engine(
                KIND,
                format!("cannot spawn {}: {error}", self.program.display()),
            )
        })?;

        let finished = tokio::select! {
            output = collect_output(&mut child) => Ok(output),
            _ = tokio::time::sleep(self.timeout) => Err(Interrupt::Timeout),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        };

        let (status, stdout, stderr) = match finished {
            Ok(output) => output.map_err(|error| {
                ExtractionError::engine(KIND, format!("reading output: {error}"))
            })?,
            Err(interrupt) => {
                terminate(&mut child).await;
                drop(workdir);
                return Err(match interrupt {
                    Interrupt::Timeout => ExtractionError::Timeout {
                        engine: KIND,
                        timeout_ms: duration_ms(self.timeout),
                    },
                    Interrupt::Cancelled => ExtractionError::Cancelled { engine: KIND },
                });
            }
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ExtractionError::engine(
                KIND,
                format!("exited with {status}: {excerpt}"),
            ));
        }

        let raw = String::from_utf8_lossy(&stdout);
        let pages: Vec<&str> = raw
            .split(PAGE_BREAK)
            .take(self.max_pages.unwrap_or(usize::MAX))
            .collect();
        tracing::debug!(
            engine = %KIND,
            pages = pages.len(),
            bytes = stdout.len(),
            "pdftotext finished"
        );
        Ok(normalize_text(&pages.join("\n")))
    }
}

/// Drain stdout and stderr concurrently, then reap the child.
async fn collect_output(child: &mut Child) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let read_stdout = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stdout.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
        }
        Ok::<_, io::Error>(buffer)
    };
    let read_stderr = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stderr.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
        }
        Ok::<_, io::Error>(buffer)
    };
    let (out, err) = tokio::try_join!(read_stdout, read_stderr)?;
    let status = child.wait().await?;
    Ok((status, out, err))
}

async fn terminate(child: &mut Child) {
    if let Err(error) = child.kill().await {
        tracing::warn!(engine = %KIND, error = %error, "Failed to kill child process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn engine(program: &str, timeout: Duration) -> PdftotextEngine {
        PdftotextEngine::new(
            PathBuf::from(program),
            timeout,
            Duration::from_millis(500),
            None,
        )
    }

    #[tokio::test]
    async fn missing_binary_fails_check_and_extract() {
        let engine = engine("/nonexistent/pdftotext-missing", Duration::from_secs(1));
        assert!(engine.check_available().await.is_err());

        let error = engine
            .extract(&Bytes::from_static(b"%PDF"), &CancellationToken::new())
            .await
            .expect_err("spawn failure");
        assert!(error.to_string().contains("cannot spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_is_killed_on_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("slow-pdftotext");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").expect("script");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }

        let engine = engine(
            script.to_str().expect("utf8 path"),
            Duration::from_millis(300),
        );
        let started = Instant::now();
        let error = engine
            .extract(&Bytes::from_static(b"%PDF"), &CancellationToken::new())
            .await
            .expect_err("timeout");

        assert!(matches!(
            error,
            ExtractionError::Timeout {
                engine: EngineKind::External,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("hung-pdftotext");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").expect("script");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }

        let engine = engine(script.to_str().expect("utf8 path"), Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let error = engine
            .extract(&Bytes::from_static(b"%PDF"), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(error, ExtractionError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_pages_are_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-pdftotext");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'Jane   Doe \\n\\fSkills:\\tRust\\n\\f'\n",
        )
        .expect("script");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }

        let engine = engine(script.to_str().expect("utf8 path"), Duration::from_secs(5));
        let text = engine
            .extract(&Bytes::from_static(b"%PDF"), &CancellationToken::new())
            .await
            .expect("text");
        assert_eq!(text, "Jane Doe\nSkills: Rust");
    }

    #[tokio::test]
    #[ignore = "requires poppler pdftotext on PATH"]
    async fn real_pdftotext_is_invocable() {
        let engine = engine("pdftotext", Duration::from_secs(5));
        assert_eq!(engine.check_available().await, Ok(()));
    }
}
