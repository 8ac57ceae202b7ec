//! Child process execution for external storage tools.

use std::{ffi::OsStr, path::Path, process::Output, time::Duration};

use itertools::Itertools;
use tokio::process::Command;

use crate::{Error, Result};

/// Run `program` with `args`, failing on a non-zero exit or after `timeout`.
///
/// The child is killed when the timeout elapses.
pub async fn run<I, S>(program: &Path, args: I, timeout: Option<Duration>) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    let rendered = render(program, &args);
    tracing::debug!("Running {rendered}");

    let mut command = Command::new(program);
    command.args(&args).kill_on_drop(true);

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| Error::CommandFailed {
                command: rendered.clone(),
                code: None,
                stderr: format!("timed out after {}s", limit.as_secs()),
            })?,
        None => command.output().await,
    }
    .map_err(|e| Error::io(format!("Failed to execute {rendered}"), e))?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::CommandFailed {
            command: rendered,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn render<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(AsRef::as_ref))
        .map(OsStr::to_string_lossy)
        .join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_returns_output() -> Result<()> {
        let output = run(Path::new("sh"), ["-c", "printf ok"], None).await?;
        assert_eq!(output.stdout, b"ok");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_reports_code_and_stderr() {
        let result = run(Path::new("sh"), ["-c", "echo boom >&2; exit 3"], None).await;
        match result {
            Err(Error::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_command_failure() {
        let result = run(
            Path::new("sh"),
            ["-c", "sleep 5"],
            Some(Duration::from_millis(50)),
        )
        .await;
        assert!(matches!(result, Err(Error::CommandFailed { code: None, .. })));
    }
}
