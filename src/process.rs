//! JSON-over-stdio subprocess calls shared by the command adapters.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Run `command` through `sh -c`, write `input` as JSON to stdin, and parse
/// the last non-empty stdout line as JSON.
///
/// Earlier stdout lines are treated as chatter and ignored. A non-zero exit
/// is an error carrying the tail of stderr.
pub async fn run_json<I, O>(
    command: &str,
    input: &I,
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<O>
where
    I: Serialize + ?Sized,
    O: DeserializeOwned,
{
    let payload = serde_json::to_vec(input).context("Failed to serialize command input")?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(cwd)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", command))?;

    debug!(command, pid = child.id().unwrap_or(0), bytes = payload.len(), "spawned");

    // A command may exit without reading its input; that is not our failure.
    if let Some(mut stdin) = child.stdin.take() {
        let written = match stdin.write_all(&payload).await {
            Ok(()) => stdin.shutdown().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e).context("Failed to write command input");
            }
        }
    }

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .with_context(|| format!("'{}' timed out after {:?}", command, limit))??,
        None => child.wait_with_output().await?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        bail!(
            "'{}' exited with {}: {}",
            command,
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .with_context(|| format!("'{}' produced no output", command))?;
    serde_json::from_str(last).with_context(|| format!("'{}' printed invalid JSON: {}", command, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_run_json_parses_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let out: Value = run_json(
            "cat > /dev/null; echo 'warming up'; echo '{\"ok\":true}'",
            &json!({"x": 1}),
            dir.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], true);
    }

    #[tokio::test]
    async fn test_run_json_sees_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out: Value = run_json("cat", &json!({"echo": "me"}), dir.path(), None)
            .await
            .unwrap();
        assert_eq!(out["echo"], "me");
    }

    #[tokio::test]
    async fn test_run_json_non_zero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_json::<_, Value>("echo broken >&2; exit 3", &json!({}), dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_run_json_invalid_output_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_json::<_, Value>("echo not-json", &json!({}), dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }
}
