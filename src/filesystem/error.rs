use thiserror::Error;

use crate::mcp::JsonRpcError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Access denied: {0}")]
    Access(String),

    #[error("{0}")]
    InvalidPath(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Maps an I/O failure on `path` to the most specific variant.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::PathNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::Access(path.to_string()),
            _ => FsError::Io(err),
        }
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            FsError::Io(_) | FsError::Watch(_) => JsonRpcError::INTERNAL_ERROR,
            _ => JsonRpcError::INVALID_PARAMS,
        };
        JsonRpcError::new(code, self.to_string())
    }
}
