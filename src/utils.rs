use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;

/// Parses `key=value` lines into a map.
///
/// Lines without `=` are skipped. Only the first `=` splits; keys and values
/// are trimmed.
pub fn parse_key_values(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), value.trim().to_string());
    }
    map
}

pub fn render_key_values(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Runs an external tool to completion and returns its combined stdout and
/// stderr.
///
/// The child is killed if `timeout` elapses or the returned future is dropped,
/// so a cancelled caller never leaves the tool running.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("`{}` is not available", program))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("`{}` timed out after {:?}", program, timeout))?
        .with_context(|| format!("waiting for `{}`", program))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trimmed_pairs_and_skips_garbage() {
        let map = parse_key_values("res=1920x1080 \n garbage line\nfps = 30\n=orphan\nurl=a=b\n");
        assert_eq!(map.len(), 3);
        assert_eq!(map["res"], "1920x1080");
        assert_eq!(map["fps"], "30");
        assert_eq!(map["url"], "a=b");
    }

    #[test]
    fn rendered_lines_parse_back() {
        let mut map = BTreeMap::new();
        map.insert("camera_id".to_string(), "1".to_string());
        map.insert("quality".to_string(), "high".to_string());
        let text = render_key_values(&map);
        assert_eq!(text, "camera_id=1\nquality=high\n");
        assert_eq!(parse_key_values(&text), map);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run_command(
            "popdroidcam-definitely-missing-tool",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("is not available"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn combines_stdout_and_stderr() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
        let output = run_command("sh", &args, Duration::from_secs(5)).await.unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_program_times_out() {
        let args = vec!["5".to_string()];
        let err = run_command("sleep", &args, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
