use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapPhase {
    #[default]
    CheckingProgress,
    StartingProject,
    WaitingActive,
    FsConnecting,
    FsMetaLoading,
    Ready,
    PtyConnecting,
    FullReady,
    Error,
}

impl BootstrapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapPhase::CheckingProgress => "checking-progress",
            BootstrapPhase::StartingProject => "starting-project",
            BootstrapPhase::WaitingActive => "waiting-active",
            BootstrapPhase::FsConnecting => "fs-connecting",
            BootstrapPhase::FsMetaLoading => "fs-meta-loading",
            BootstrapPhase::Ready => "ready",
            BootstrapPhase::PtyConnecting => "pty-connecting",
            BootstrapPhase::FullReady => "full-ready",
            BootstrapPhase::Error => "error",
        }
    }

    /// Position in the forward order; `error` sits outside it.
    pub fn rank(self) -> Option<u8> {
        let rank = match self {
            BootstrapPhase::CheckingProgress => 0,
            BootstrapPhase::StartingProject => 1,
            BootstrapPhase::WaitingActive => 2,
            BootstrapPhase::FsConnecting => 3,
            BootstrapPhase::FsMetaLoading => 4,
            BootstrapPhase::Ready => 5,
            BootstrapPhase::PtyConnecting => 6,
            BootstrapPhase::FullReady => 7,
            BootstrapPhase::Error => return None,
        };
        Some(rank)
    }

    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Forward moves are always allowed. The backward exceptions are the
    /// silent fall back to `fs-connecting` while metadata is still missing,
    /// and `full-ready` dropping to `pty-connecting` or `ready` when the PTY
    /// goes away. `error` is reachable from anywhere and is only left when a
    /// PTY failure heals.
    pub fn allows(self, to: BootstrapPhase, meta_loaded: bool, error: Option<ErrorCode>) -> bool {
        if self == to || to == BootstrapPhase::Error {
            return true;
        }
        match (self.rank(), to.rank()) {
            (None, _) => {
                error == Some(ErrorCode::PtyConnectFailed)
                    && matches!(to, BootstrapPhase::PtyConnecting | BootstrapPhase::FullReady)
            }
            (Some(_), None) => true,
            (Some(from), Some(next)) => {
                if next >= from {
                    return true;
                }
                match (self, to) {
                    (
                        BootstrapPhase::FsMetaLoading
                        | BootstrapPhase::Ready
                        | BootstrapPhase::PtyConnecting,
                        BootstrapPhase::FsConnecting,
                    ) => !meta_loaded,
                    (
                        BootstrapPhase::FullReady,
                        BootstrapPhase::PtyConnecting | BootstrapPhase::Ready,
                    ) => true,
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MaxLabsExceeded,
    ProgressFetchFailed,
    FsConnectFailed,
    MetaFetchFailed,
    MetaTimeout,
    PtyConnectFailed,
    TestExecutionFailed,
    FileLoadFailed,
    FileSaveFailed,
    FileSaveConflict,
    FileCreateFailed,
    FileDeleteFailed,
    FileRenameFailed,
    DirLoadFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MaxLabsExceeded => "max_labs_exceeded",
            ErrorCode::ProgressFetchFailed => "progress_fetch_failed",
            ErrorCode::FsConnectFailed => "fs_connect_failed",
            ErrorCode::MetaFetchFailed => "meta_fetch_failed",
            ErrorCode::MetaTimeout => "meta_timeout",
            ErrorCode::PtyConnectFailed => "pty_connect_failed",
            ErrorCode::TestExecutionFailed => "test_execution_failed",
            ErrorCode::FileLoadFailed => "file_load_failed",
            ErrorCode::FileSaveFailed => "file_save_failed",
            ErrorCode::FileSaveConflict => "file_save_conflict",
            ErrorCode::FileCreateFailed => "file_create_failed",
            ErrorCode::FileDeleteFailed => "file_delete_failed",
            ErrorCode::FileRenameFailed => "file_rename_failed",
            ErrorCode::DirLoadFailed => "dir_load_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single user-visible error slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabIssue {
    pub code: ErrorCode,
    pub message: String,
}

impl LabIssue {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for LabIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BootstrapPhase::*;

    const ORDER: [BootstrapPhase; 8] = [
        CheckingProgress,
        StartingProject,
        WaitingActive,
        FsConnecting,
        FsMetaLoading,
        Ready,
        PtyConnecting,
        FullReady,
    ];

    #[test]
    fn forward_moves_and_error_are_always_allowed() {
        for (i, from) in ORDER.iter().enumerate() {
            for to in &ORDER[i..] {
                assert!(from.allows(*to, false, None), "{from} -> {to}");
            }
            assert!(from.allows(Error, true, None));
        }
    }

    #[test]
    fn rollback_to_fs_connecting_only_before_metadata() {
        assert!(FsMetaLoading.allows(FsConnecting, false, None));
        assert!(Ready.allows(FsConnecting, false, None));
        assert!(!Ready.allows(FsConnecting, true, None));
        assert!(!FsMetaLoading.allows(WaitingActive, false, None));
    }

    #[test]
    fn pty_drop_leaves_full_ready() {
        assert!(FullReady.allows(PtyConnecting, true, None));
        assert!(FullReady.allows(Ready, true, None));
        assert!(!PtyConnecting.allows(Ready, true, None));
    }

    #[test]
    fn error_is_left_only_when_pty_heals() {
        assert!(Error.allows(FullReady, true, Some(ErrorCode::PtyConnectFailed)));
        assert!(!Error.allows(FullReady, true, Some(ErrorCode::MaxLabsExceeded)));
        assert!(!Error.allows(Ready, true, Some(ErrorCode::PtyConnectFailed)));
    }

    #[test]
    fn wire_names_match_display() {
        assert_eq!(FsMetaLoading.to_string(), "fs-meta-loading");
        assert_eq!(
            serde_json::to_value(ErrorCode::MaxLabsExceeded).unwrap(),
            "max_labs_exceeded"
        );
        assert_eq!(serde_json::to_value(PtyConnecting).unwrap(), "pty-connecting");
    }
}
