use std::ffi::OsString;
use std::process::Output;
use tokio::process::Command;

/// Runs `program` with `args` to completion and captures its output.
///
/// The child is killed if the returned future is dropped before it exits.
pub(crate) async fn run(program: &str, args: Vec<OsString>) -> std::io::Result<Output> {
    Command::new(program).args(&args).kill_on_drop(true).output().await
}

/// Formats a failed process's exit status and trimmed output for error messages.
pub(crate) fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    format!(
        "{}{}{}",
        output.status.code().map_or_else(|| "terminated".into(), |c| format!("exit code {c}")),
        if stderr.trim().is_empty() { String::new() } else { format!(" stderr: {}", stderr.trim()) },
        if stdout.trim().is_empty() { String::new() } else { format!(" stdout: {}", stdout.trim()) },
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<OsString> {
        vec!["-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_run_captures_failure() {
        let output = run("sh", sh("echo oops >&2; echo out; exit 3")).await.unwrap();
        assert!(!output.status.success());
        assert_eq!(describe_failure(&output), "exit code 3 stderr: oops stdout: out");
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let err = run("forge-no-such-program", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_dropped_run_kills_child() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("finished");
        let script = format!("sleep 1; touch '{}'", marker.display());

        let timed_out = tokio::time::timeout(Duration::from_millis(100), run("sh", sh(&script))).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
