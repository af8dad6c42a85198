//! The external compiler collaborator.
//!
//! The host never inspects compiler internals; it only sees the
//! outcome plus human-readable diagnostics written to the realm's
//! report file.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    Success,
    /// Source file absent.
    Missing,
    /// The source failed to translate.
    SourceError,
    /// The toolchain itself failed.
    BuildError,
    /// The compiler ran past its deadline and was killed.
    Timeout,
}

#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        realm: &str,
        source: &Path,
        image: &Path,
        report: &Path,
    ) -> CompileOutcome;
}

/// Runs an external compiler process:
/// `<program> <realm> <source> <image>`. Exit 0 is success, exit 1 a
/// source error, anything else a build error. A run past `timeout` is
/// killed and reported as [`CompileOutcome::Timeout`], never as a
/// hang of the host.
pub struct ExternalCompiler {
    pub program: std::path::PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl Compiler for ExternalCompiler {
    async fn compile(
        &self,
        realm: &str,
        source: &Path,
        image: &Path,
        report: &Path,
    ) -> CompileOutcome {
        if !source.exists() {
            return CompileOutcome::Missing;
        }

        let child = Command::new(&self.program)
            .arg(realm)
            .arg(source)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(realm, err = %e, "compiler failed to start");
                write_report(report, &format!("compiler failed to start: {e}\n")).await;
                return CompileOutcome::BuildError;
            }
        };

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                warn!(realm, err = %e, "compiler wait failed");
                return CompileOutcome::BuildError;
            }
            Err(_) => {
                // kill_on_drop reaps the process.
                warn!(realm, timeout_ms = self.timeout.as_millis() as u64, "compiler timed out");
                write_report(report, "compiler timed out\n").await;
                return CompileOutcome::Timeout;
            }
        };

        let mut diag = String::from_utf8_lossy(&out.stdout).into_owned();
        diag.push_str(&String::from_utf8_lossy(&out.stderr));
        write_report(report, &diag).await;

        match out.status.code() {
            Some(0) => CompileOutcome::Success,
            Some(1) => CompileOutcome::SourceError,
            _ => CompileOutcome::BuildError,
        }
    }
}

async fn write_report(path: &Path, text: &str) {
    let write = async {
        let mut f = tokio::fs::File::create(path).await?;
        f.write_all(text.as_bytes()).await?;
        f.flush().await
    };
    if let Err(e) = write.await {
        warn!(path = %path.display(), err = %e, "failed to write compile report");
    }
}

/// Pretends every compile succeeds by touching the image file. Used
/// for factories whose workers ignore the image (the built-in echo
/// realm) and by tests.
pub struct NoopCompiler;

#[async_trait]
impl Compiler for NoopCompiler {
    async fn compile(
        &self,
        _realm: &str,
        source: &Path,
        image: &Path,
        _report: &Path,
    ) -> CompileOutcome {
        if !source.exists() {
            return CompileOutcome::Missing;
        }
        match tokio::fs::write(image, b"").await {
            Ok(()) => CompileOutcome::Success,
            Err(_) => CompileOutcome::BuildError,
        }
    }
}
