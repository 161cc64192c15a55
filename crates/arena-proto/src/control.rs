use crate::DecodeError;
use crate::records::FileRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

/// Outgoing control-channel message families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    InitializeClient,
    FetchQuestMeta,
    LoadDir,
    FetchFileContent,
    UpdateFileContent,
    NewFile,
    DeleteFile,
    EditFileMeta,
}

impl RequestKind {
    pub const ALL: [RequestKind; 8] = [
        RequestKind::InitializeClient,
        RequestKind::FetchQuestMeta,
        RequestKind::LoadDir,
        RequestKind::FetchFileContent,
        RequestKind::UpdateFileContent,
        RequestKind::NewFile,
        RequestKind::DeleteFile,
        RequestKind::EditFileMeta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::InitializeClient => "fs_initialize_client",
            RequestKind::FetchQuestMeta => "fs_fetch_quest_meta",
            RequestKind::LoadDir => "fs_load_dir",
            RequestKind::FetchFileContent => "fs_fetch_file_content",
            RequestKind::UpdateFileContent => "fs_file_content_update",
            RequestKind::NewFile => "fs_new_file",
            RequestKind::DeleteFile => "fs_delete_file",
            RequestKind::EditFileMeta => "fs_edit_file_meta",
        }
    }

    /// The response type a server sends back for this request. Servers do not
    /// always echo `request_id`, so this table drives FIFO matching.
    pub fn response(self) -> ResponseKind {
        match self {
            RequestKind::InitializeClient => ResponseKind::Info,
            RequestKind::FetchQuestMeta => ResponseKind::QuestMeta,
            RequestKind::LoadDir => ResponseKind::DirContent,
            RequestKind::FetchFileContent => ResponseKind::FileContent,
            RequestKind::UpdateFileContent => ResponseKind::FileUpdated,
            RequestKind::NewFile => ResponseKind::FileCreated,
            RequestKind::DeleteFile => ResponseKind::FileDeleted,
            RequestKind::EditFileMeta => ResponseKind::FileRenamed,
        }
    }
}

/// Incoming control-channel message families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Info,
    QuestMeta,
    DirContent,
    FileContent,
    FileUpdated,
    FileCreated,
    FileDeleted,
    FileRenamed,
    Error,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::Info => "info",
            ResponseKind::QuestMeta => "quest_meta",
            ResponseKind::DirContent => "dir_content",
            ResponseKind::FileContent => "file_content",
            ResponseKind::FileUpdated => "file_updated",
            ResponseKind::FileCreated => "file_created",
            ResponseKind::FileDeleted => "file_deleted",
            ResponseKind::FileRenamed => "file_renamed",
            ResponseKind::Error => "error",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        let kind = match raw {
            "info" => ResponseKind::Info,
            "quest_meta" => ResponseKind::QuestMeta,
            "dir_content" => ResponseKind::DirContent,
            "file_content" => ResponseKind::FileContent,
            "file_updated" => ResponseKind::FileUpdated,
            "file_created" => ResponseKind::FileCreated,
            "file_deleted" => ResponseKind::FileDeleted,
            "file_renamed" => ResponseKind::FileRenamed,
            "error" => ResponseKind::Error,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    InitializeClient { language: String, lab_id: String },
    FetchQuestMeta { path: String },
    LoadDir { path: String },
    FetchFileContent { path: String },
    UpdateFileContent { path: String, content: String },
    NewFile { path: String, is_dir: bool, content: String },
    DeleteFile { path: String },
    EditFileMeta { old_path: String, new_path: String },
}

impl ControlRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            ControlRequest::InitializeClient { .. } => RequestKind::InitializeClient,
            ControlRequest::FetchQuestMeta { .. } => RequestKind::FetchQuestMeta,
            ControlRequest::LoadDir { .. } => RequestKind::LoadDir,
            ControlRequest::FetchFileContent { .. } => RequestKind::FetchFileContent,
            ControlRequest::UpdateFileContent { .. } => RequestKind::UpdateFileContent,
            ControlRequest::NewFile { .. } => RequestKind::NewFile,
            ControlRequest::DeleteFile { .. } => RequestKind::DeleteFile,
            ControlRequest::EditFileMeta { .. } => RequestKind::EditFileMeta,
        }
    }

    pub fn payload(&self) -> Map<String, Value> {
        let value = match self {
            ControlRequest::InitializeClient { language, lab_id } => {
                json!({ "language": language, "labId": lab_id })
            }
            ControlRequest::FetchQuestMeta { path }
            | ControlRequest::LoadDir { path }
            | ControlRequest::FetchFileContent { path }
            | ControlRequest::DeleteFile { path } => json!({ "path": path }),
            ControlRequest::UpdateFileContent { path, content } => {
                json!({ "path": path, "content": content })
            }
            ControlRequest::NewFile {
                path,
                is_dir,
                content,
            } => json!({ "path": path, "isDir": is_dir, "content": content }),
            ControlRequest::EditFileMeta { old_path, new_path } => {
                json!({ "oldPath": old_path, "newPath": new_path })
            }
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Outbound frame. A correlated envelope carries the id at the top level and
/// again inside the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: RequestKind,
    pub request_id: Option<String>,
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn correlated(request: &ControlRequest, request_id: &str) -> Self {
        let mut payload = request.payload();
        payload.insert("request_id".into(), Value::String(request_id.to_string()));
        Self {
            kind: request.kind(),
            request_id: Some(request_id.to_string()),
            payload,
        }
    }

    pub fn one_way(request: &ControlRequest) -> Self {
        Self {
            kind: request.kind(),
            request_id: None,
            payload: request.payload(),
        }
    }

    pub fn to_text(&self) -> String {
        let mut frame = Map::new();
        frame.insert("type".into(), Value::String(self.kind.as_str().into()));
        if let Some(id) = &self.request_id {
            frame.insert("request_id".into(), Value::String(id.clone()));
        }
        frame.insert("payload".into(), Value::Object(self.payload.clone()));
        Value::Object(frame).to_string()
    }
}

pub fn ping_frame() -> String {
    json!({ "type": "ping" }).to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    #[default]
    Success,
    Error,
    Info,
}

/// Decoded inbound control frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub kind: ResponseKind,
    pub status: ResponseStatus,
    pub data: Value,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl ControlFrame {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let wire: WireFrame = serde_json::from_str(text).map_err(DecodeError::Json)?;
        let raw_kind = wire.kind.ok_or(DecodeError::MissingType)?;
        let kind = ResponseKind::from_wire(&raw_kind).ok_or(DecodeError::UnknownType(raw_kind))?;
        Ok(Self {
            kind,
            status: wire.status,
            data: wire.data,
            message: wire.message.filter(|m| !m.is_empty()),
            request_id: wire.request_id.filter(|id| !id.is_empty()),
            timestamp: wire.timestamp,
        })
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error || self.kind == ResponseKind::Error
    }

    /// Best human-readable failure text: the envelope message, then
    /// `data.details`, then `data.message`.
    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| string_field(&self.data, "details"))
            .or_else(|| string_field(&self.data, "message"))
            .unwrap_or_else(|| "Request failed".to_string())
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| DecodeError::Malformed {
            kind: self.kind.as_str(),
            source,
        })
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestMeta {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirContent {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

/// Data of an unsolicited `file_updated` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileUpdated {
    pub path: String,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}
