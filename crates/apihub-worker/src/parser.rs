//! Specification parsers
//!
//! The worker treats the parser as a pure function from a build source to a
//! [`BuildResult`]. [`ProcessParser`] runs an external command for it.

use apihub_common::types::{BuildResult, BuildSourcePayload};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Result, WorkerError};

/// File names the parser command finds in its working directory
pub const SOURCE_FILE: &str = "sources.zip";
pub const CONFIG_FILE: &str = "config.json";
pub const CONTEXT_FILE: &str = "context.json";

/// Bytes of stderr kept in a failure report
const STDERR_TAIL_BYTES: usize = 2048;

#[async_trait]
pub trait SpecParser: Send + Sync {
    async fn parse(&self, source: &BuildSourcePayload) -> Result<BuildResult>;
}

/// Runs `sh -c <command>` inside a scratch directory holding the build
/// source, config and context, and reads the result JSON from stdout.
///
/// The command also sees `APIHUB_BUILD_ID`, `APIHUB_SOURCE`, `APIHUB_CONFIG`
/// and `APIHUB_CONTEXT` in its environment.
#[derive(Debug, Clone)]
pub struct ProcessParser {
    command: String,
}

impl ProcessParser {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn stage(dir: &Path, source: &BuildSourcePayload) -> Result<()> {
        tokio::fs::write(dir.join(SOURCE_FILE), &source.source).await?;
        tokio::fs::write(dir.join(CONFIG_FILE), serde_json::to_vec(&source.config)?).await?;
        tokio::fs::write(dir.join(CONTEXT_FILE), serde_json::to_vec(&source.context)?).await?;
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[async_trait]
impl SpecParser for ProcessParser {
    async fn parse(&self, source: &BuildSourcePayload) -> Result<BuildResult> {
        let workdir = tempfile::tempdir()?;
        Self::stage(workdir.path(), source).await?;

        tracing::debug!(
            build_id = %source.build_id,
            command = %self.command,
            "Running parser"
        );

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workdir.path())
            .env("APIHUB_BUILD_ID", &source.build_id)
            .env("APIHUB_SOURCE", workdir.path().join(SOURCE_FILE))
            .env("APIHUB_CONFIG", workdir.path().join(CONFIG_FILE))
            .env("APIHUB_CONTEXT", workdir.path().join(CONTEXT_FILE))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(WorkerError::parser(format!(
                "command exited with {}: {}",
                code,
                stderr_tail(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| WorkerError::parser(format!("invalid build result on stdout: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use apihub_common::types::{BuildConfig, BuildContext, BuildType};

    fn payload() -> BuildSourcePayload {
        BuildSourcePayload {
            build_id: "b-42".to_string(),
            config: BuildConfig::new(BuildType::Build, "acme.svc", "1.0"),
            source: b"PK-sources".to_vec(),
            context: BuildContext {
                package_id: "acme.svc".to_string(),
                version: "1.0".to_string(),
                revision: 1,
                previous: None,
            },
        }
    }

    const RESULT: &str =
        r#"{"version":{"package_id":"acme.svc","version":"1.0","created_by":"ci"}}"#;

    #[tokio::test]
    async fn test_reads_result_from_stdout() {
        let parser = ProcessParser::new(format!(
            "test \"$(cat {})\" = PK-sources && test \"$APIHUB_BUILD_ID\" = b-42 && echo '{}'",
            SOURCE_FILE, RESULT
        ));
        let result = parser.parse(&payload()).await.unwrap();
        assert_eq!(result.version.package_id, "acme.svc");
        assert_eq!(result.version.revision, None);
        assert!(result.documents.is_empty());
    }

    #[tokio::test]
    async fn test_config_and_context_are_staged() {
        let parser = ProcessParser::new(format!(
            "grep -q '\"revision\":1' \"$APIHUB_CONTEXT\" && grep -q acme.svc {} && echo '{}'",
            CONFIG_FILE, RESULT
        ));
        assert!(parser.parse(&payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let parser = ProcessParser::new("echo 'unsupported openapi version' >&2; exit 3");
        let err = parser.parse(&payload()).await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, WorkerError::Parser(_)));
        assert!(msg.contains("exited with 3"), "{}", msg);
        assert!(msg.contains("unsupported openapi version"), "{}", msg);
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_a_parser_error() {
        let parser = ProcessParser::new("echo not-json");
        let err = parser.parse(&payload()).await.unwrap_err();
        assert!(err.to_string().contains("invalid build result"));
    }

    #[test]
    fn test_stderr_tail_truncates_from_the_front() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 10) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("END"));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }
}
