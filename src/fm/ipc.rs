use serde::{Deserialize, Serialize};

/// Advisory messages written to a worker's stdin as newline-delimited JSON.
/// No reply is expected and supervisor logic never blocks on delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ToWorker {
    ReplaceFaultyWorker {
        reason: String,
        old_pid: u32,
        new_pid: u32,
    },
    MemHigh {
        mem_perc: f64,
    },
}

/// Messages a worker may emit on its stdout, one JSON object per line.
/// Stdout lines that do not parse as one of these are treated as worker log
/// output and pumped to the supervisor's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum FromWorker {
    /// Sent exactly once, when the worker is ready to serve. A filesystem-path
    /// `address` enables socket registry handling for that path.
    Listening {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    PauseMonitoring,
    ResumeMonitoring,
}

pub fn encode(msg: &ToWorker) -> String {
    // Infallible for these shapes; a failure here would be a programming error.
    let mut line = serde_json::to_string(msg).unwrap_or_default();
    line.push('\n');
    line
}

pub fn decode_worker_line(line: &str) -> Option<FromWorker> {
    serde_json::from_str(line.trim()).ok()
}
