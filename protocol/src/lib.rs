//! Wire types shared between the supervisor core and the transport layer
//! that exposes it over HTTP/SSE. Everything here is plain data: the
//! transport deserializes requests into these shapes and serializes the
//! supervisor's answers back out without interpreting them.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use ts_rs::TS;

/// Parameters for launching a run.
///
/// `run_id` must be unique among currently tracked runs; the caller owns
/// uniqueness. With `shell` set, the command line is interpreted by the
/// platform shell, which is required for script files such as `.bat`.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LaunchParams {
    pub run_id: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the child; inherits the supervisor's when absent.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Extra environment variables; these win over the supervisor's own
    /// environment on key collision.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub shell: bool,
}

/// Parameters for launching a platform script file. Always shell-interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LaunchScriptParams {
    pub run_id: String,
    pub script_path: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One captured line of child output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LogLine {
    /// Capture time, formatted for human display.
    pub timestamp: String,
    pub text: String,
}

/// A single delivery to a stream subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[ts(export)]
pub enum StreamEvent {
    Line(LogLine),
    /// Periodic liveness marker so idle transports can detect a dead peer.
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RunStatus {
    Running,
    Exited,
}

/// One row of the `list` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RunSummary {
    pub run_id: String,
    pub pid: Option<u32>,
    pub status: RunStatus,
    pub log_lines: usize,
    pub subscribers: usize,
}

/// Outcome of a stop request. Stopping an unknown or already-finished run
/// is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StopOutcome {
    TerminationRequested,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealthStatus {
    pub status: String,
    pub tracked_runs: usize,
}

impl HealthStatus {
    pub fn operational(tracked_runs: usize) -> Self {
        Self {
            status: "ok".to_string(),
            tracked_runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn launch_params_fill_defaults() {
        let params: LaunchParams = serde_json::from_value(json!({
            "run_id": "build-1",
            "command": "cargo",
        }))
        .expect("deserialize launch params");
        assert_eq!(params.run_id, "build-1");
        assert!(params.args.is_empty());
        assert!(params.env.is_empty());
        assert!(!params.shell);
        assert!(params.cwd.is_none());
    }

    #[test]
    fn stream_events_tag_their_variant() {
        let line = StreamEvent::Line(LogLine {
            timestamp: "12:00:00.000".to_string(),
            text: "step1".to_string(),
        });
        let encoded = serde_json::to_value(&line).expect("serialize line event");
        assert_eq!(
            encoded,
            json!({
                "type": "line",
                "data": { "timestamp": "12:00:00.000", "text": "step1" }
            })
        );

        let keep_alive =
            serde_json::to_value(StreamEvent::KeepAlive).expect("serialize keepalive");
        assert_eq!(keep_alive, json!({ "type": "keep_alive" }));
    }
}
