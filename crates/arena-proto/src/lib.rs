//! Wire schema for the lab runner.
//!
//! Two WebSocket channels (file-system control and PTY execution) plus the
//! provisioning HTTP DTOs. Every inbound shape is decoded through an explicit
//! function that rejects unknown or malformed frames instead of passing raw
//! JSON further in.

pub mod control;
pub mod exec;
pub mod provision;
pub mod records;

pub use control::{
    ControlFrame, ControlRequest, DirContent, Envelope, FileContent, FileUpdated, QuestMeta,
    RequestKind, ResponseKind, ResponseStatus, ping_frame,
};
pub use exec::{ExecCommand, ExecEvent, ExecFrame};
pub use provision::{
    ActiveCheckpoint, FILE_SYSTEM_SERVICE, ProgressReport, ServiceLog, StartProjectRequest,
    TestResultsField, TestResultsReport,
};
pub use records::{
    CheckpointRef, CheckpointResult, ErrorDetail, FileRecord, RawCheckpointResult,
    normalize_keyed,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame is missing a string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` frame: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
