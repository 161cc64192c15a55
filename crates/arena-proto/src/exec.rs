use crate::DecodeError;
use crate::records::{CheckpointRef, CheckpointResult, RawCheckpointResult, lenient};
use serde::Deserialize;
use serde_json::{Value, json};

/// Outbound frames for the PTY channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    CheckpointTest {
        checkpoint_id: String,
        language: String,
    },
    Input(String),
    Resize {
        cols: u16,
        rows: u16,
    },
    KillUserProcesses,
    Run {
        init_commands: Vec<String>,
        run_command: String,
    },
    Heartbeat,
    HeartbeatResponse,
}

impl ExecCommand {
    pub fn to_text(&self) -> String {
        let frame = match self {
            // the runner expects `data` as a JSON-encoded string
            ExecCommand::CheckpointTest {
                checkpoint_id,
                language,
            } => {
                let inner = json!({
                    "type": "checkpoint",
                    "checkpointId": checkpoint_id,
                    "language": language,
                });
                json!({ "type": "test", "data": inner.to_string() })
            }
            ExecCommand::Input(data) => json!({ "type": "input", "data": data }),
            ExecCommand::Resize { cols, rows } => {
                json!({ "type": "resize", "cols": cols, "rows": rows })
            }
            ExecCommand::KillUserProcesses => json!({ "type": "kill_user_processes" }),
            ExecCommand::Run {
                init_commands,
                run_command,
            } => {
                let inner = json!({ "initCommands": init_commands, "runCommand": run_command });
                json!({ "type": "run", "data": inner.to_string() })
            }
            ExecCommand::Heartbeat => json!({ "type": "heartbeat" }),
            ExecCommand::HeartbeatResponse => json!({ "type": "heartbeat_response" }),
        };
        frame.to_string()
    }
}

/// Structured PTY-channel events.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    TestStarted {
        checkpoint_id: Option<String>,
    },
    TestProgress(Value),
    TestCompleted {
        results: Vec<CheckpointResult>,
        active_checkpoint: Option<u32>,
    },
    TestError {
        message: String,
    },
    RunExecuting {
        step: String,
    },
    RunCompleted {
        step: Option<String>,
        status: String,
        code: Option<i64>,
    },
    ServerReady {
        url: String,
    },
    RunError {
        message: Option<String>,
    },
    Heartbeat,
}

/// Either a protocol event or raw terminal output.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecFrame {
    Event(ExecEvent),
    Output(String),
}

#[derive(Deserialize, Default)]
struct StartedData {
    #[serde(default, rename = "checkpointId")]
    checkpoint_id: Option<CheckpointRef>,
}

#[derive(Deserialize)]
struct CompletedData {
    #[serde(default, deserialize_with = "lenient")]
    results: Option<Vec<Value>>,
    #[serde(default, rename = "activeCheckpoint", deserialize_with = "lenient")]
    active_checkpoint: Option<CheckpointRef>,
}

#[derive(Deserialize, Default)]
struct MessageData {
    #[serde(default, deserialize_with = "lenient")]
    message: Option<String>,
}

#[derive(Deserialize, Default)]
struct StepData {
    #[serde(default)]
    step: Option<String>,
}

#[derive(Deserialize, Default)]
struct RunCompletedData {
    #[serde(default)]
    step: Option<String>,
    #[serde(default)]
    status: Option<String>,
    // the runner reports exit codes as strings
    #[serde(default)]
    code: Option<Value>,
}

impl ExecFrame {
    /// Anything that is not a JSON object with a known `type` is terminal
    /// output. A known type with a malformed body is an error.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let Ok(Value::Object(mut frame)) = serde_json::from_str::<Value>(text) else {
            return Ok(ExecFrame::Output(text.to_string()));
        };
        let Some(kind) = frame.get("type").and_then(Value::as_str).map(str::to_string) else {
            return Ok(ExecFrame::Output(text.to_string()));
        };
        let data = frame.remove("data").unwrap_or(Value::Null);
        let event = match kind.as_str() {
            "test_started" => {
                let started: StartedData = body("test_started", data)?;
                ExecEvent::TestStarted {
                    checkpoint_id: started.checkpoint_id.map(|c| c.id()),
                }
            }
            "test_progress" => ExecEvent::TestProgress(data),
            "test_completed" => completed(data)?,
            "test_error" => {
                let message = match data {
                    Value::String(message) => Some(message),
                    data => body::<MessageData>("test_error", data)?.message,
                };
                ExecEvent::TestError {
                    message: message.unwrap_or_else(|| "Unknown test error".to_string()),
                }
            }
            "run_executing" => {
                let step: StepData = body("run_executing", data)?;
                ExecEvent::RunExecuting {
                    step: step.step.unwrap_or_else(|| "unknown".to_string()),
                }
            }
            "run_completed" => {
                let done: RunCompletedData = body("run_completed", data)?;
                ExecEvent::RunCompleted {
                    step: done.step,
                    status: done.status.unwrap_or_default(),
                    code: done.code.as_ref().and_then(exit_code),
                }
            }
            "server_ready" => {
                let url: String = body("server_ready", data)?;
                ExecEvent::ServerReady { url }
            }
            "run_error" => {
                let error: MessageData = body("run_error", data)?;
                ExecEvent::RunError {
                    message: error.message,
                }
            }
            "heartbeat" => ExecEvent::Heartbeat,
            "output" => {
                let output = match data {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                return Ok(ExecFrame::Output(output));
            }
            _ => return Ok(ExecFrame::Output(text.to_string())),
        };
        Ok(ExecFrame::Event(event))
    }
}

fn body<T>(kind: &'static str, data: Value) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|source| DecodeError::Malformed { kind, source })
}

fn exit_code(raw: &Value) -> Option<i64> {
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
}

fn completed(data: Value) -> Result<ExecEvent, DecodeError> {
    if data.is_null() {
        return Ok(ExecEvent::TestCompleted {
            results: Vec::new(),
            active_checkpoint: None,
        });
    }
    let envelope: CompletedData = serde_json::from_value(data.clone())
        .map_err(|source| DecodeError::Malformed { kind: "test_completed", source })?;
    let results = match envelope.results {
        // entries that are not result objects are skipped, the rest still count
        Some(batch) => batch
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<RawCheckpointResult>(raw).ok())
            .filter_map(RawCheckpointResult::normalize)
            .collect(),
        None => {
            // single-result payload
            let single: RawCheckpointResult = serde_json::from_value(data)
                .map_err(|source| DecodeError::Malformed { kind: "test_completed", source })?;
            single.normalize().into_iter().collect()
        }
    };
    Ok(ExecEvent::TestCompleted {
        results,
        active_checkpoint: envelope.active_checkpoint.as_ref().and_then(CheckpointRef::number),
    })
}
