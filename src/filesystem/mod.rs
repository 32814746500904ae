//! A sandboxed filesystem tool provider.
//!
//! Every path a client supplies is resolved against the configured root and
//! rejected if it ends up outside of it, symlinks included.

mod error;
mod server;
#[cfg(feature = "watch")]
mod watcher;

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::broadcast;

use crate::mcp::JsonRpcNotification;

pub use error::FsError;

pub const CHANGE_METHOD: &str = "filesystem/change";

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "current_dir")]
    path: String,
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    path: String,
    content: String,
    #[serde(default)]
    encoding: Option<String>,
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, FsError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|err| FsError::InvalidParams(err.to_string()))
}

const MAX_LINK_DEPTH: usize = 40;

/// Lexically removes `.` and `..` components. `None` when `..` climbs past
/// the filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}

/// Canonicalizes the longest existing prefix of `path` and re-attaches the
/// missing tail. A dangling symlink in the prefix is followed to its target.
fn resolve(path: PathBuf, depth: usize) -> Result<PathBuf, FsError> {
    if depth > MAX_LINK_DEPTH {
        return Err(FsError::InvalidPath("Too many levels of symbolic links".into()));
    }

    // A dangling link counts as an existing entry.
    let mut existing = path.as_path();
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_owned());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = match existing.canonicalize() {
        Ok(resolved) => resolved,
        Err(err) => {
            let is_link = std::fs::symlink_metadata(existing)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                return Err(FsError::InvalidPath(format!("Invalid path: {err}")));
            }
            let target = std::fs::read_link(existing)
                .map_err(|err| FsError::InvalidPath(format!("Invalid path: {err}")))?;
            let base = existing.parent().unwrap_or(Path::new("/"));
            let mut followed = normalize(&base.join(target))
                .ok_or_else(|| FsError::InvalidPath("Path outside root directory".into()))?;
            for name in missing.iter().rev() {
                followed.push(name);
            }
            return resolve(followed, depth + 1);
        }
    };
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

pub struct FilesystemServer {
    root: PathBuf,
    watch: bool,
    changes: broadcast::Sender<JsonRpcNotification>,
    #[cfg(feature = "watch")]
    watcher: Mutex<Option<watcher::ChangeWatcher>>,
    #[cfg(not(feature = "watch"))]
    watcher: Mutex<Option<()>>,
}

impl FilesystemServer {
    pub fn new(root: impl AsRef<Path>, watch: bool) -> Result<Self, FsError> {
        let requested = root.as_ref();
        let root = std::fs::canonicalize(requested)
            .map_err(|err| FsError::from_io(err, &requested.display().to_string()))?;
        if !root.is_dir() {
            return Err(FsError::InvalidPath(format!(
                "Root is not a directory: {}",
                requested.display()
            )));
        }
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Ok(Self {
            root,
            watch,
            changes,
            watcher: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Change notifications produced by the watcher.
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.changes.subscribe()
    }

    /// Starts the change watcher when the server was created with
    /// `watch = true`.
    pub fn start(&self) -> Result<(), FsError> {
        if !self.watch {
            return Ok(());
        }
        #[cfg(feature = "watch")]
        {
            let mut slot = self
                .watcher
                .lock()
                .map_err(|_| FsError::Watch("watcher state poisoned".into()))?;
            if slot.is_none() {
                *slot = Some(watcher::ChangeWatcher::spawn(
                    self.root.clone(),
                    self.changes.clone(),
                )?);
                tracing::info!(root = %self.root.display(), "watching for filesystem changes");
            }
        }
        #[cfg(not(feature = "watch"))]
        tracing::warn!("built without the `watch` feature, change notifications are disabled");
        Ok(())
    }

    /// Stops the watcher and waits for its task to finish.
    pub async fn stop(&self) {
        let running = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        #[cfg(feature = "watch")]
        {
            if let Some(watcher) = running {
                watcher.stop().await;
                tracing::debug!("filesystem watcher stopped");
            }
        }
        #[cfg(not(feature = "watch"))]
        drop(running);
    }

    /// Resolves `path` against the root. Fails when the resolved location,
    /// after following symlinks of the existing part, is outside the root.
    pub fn validate_path(&self, path: &str) -> Result<PathBuf, FsError> {
        let normalized = normalize(&self.root.join(path))
            .ok_or_else(|| FsError::InvalidPath(format!("Invalid path: {path}")))?;
        let resolved = resolve(normalized, 0)?;
        if !resolved.starts_with(&self.root) {
            return Err(FsError::InvalidPath("Path outside root directory".into()));
        }
        Ok(resolved)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    pub async fn list(&self, path: &str) -> Result<Value, FsError> {
        let full = self.validate_path(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        if !meta.is_dir() {
            return Err(FsError::InvalidPath(format!("Not a directory: {path}")));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let size = if meta.is_file() { Some(meta.len()) } else { None };
            entries.push((
                name.clone(),
                json!({
                    "name": name,
                    "path": self.relative(&entry.path()),
                    "type": if meta.is_dir() { "directory" } else { "file" },
                    "size": size,
                }),
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(json!({
            "entries": entries.into_iter().map(|(_, entry)| entry).collect::<Vec<_>>()
        }))
    }

    pub async fn read(&self, path: &str) -> Result<Value, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidParams("Path is required".into()));
        }
        let full = self.validate_path(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        if !meta.is_file() {
            return Err(FsError::InvalidPath(format!("Not a file: {path}")));
        }

        let bytes = fs::read(&full)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        let size = bytes.len();
        let (content, encoding) = match String::from_utf8(bytes) {
            Ok(text) => (text, "utf-8"),
            Err(err) => (BASE64.encode(err.into_bytes()), "base64"),
        };
        Ok(json!({ "content": content, "size": size, "encoding": encoding }))
    }

    pub async fn write(
        &self,
        path: &str,
        content: &str,
        encoding: Option<&str>,
    ) -> Result<Value, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidParams("Path is required".into()));
        }
        let bytes = match encoding {
            None | Some("utf-8") | Some("utf8") => content.as_bytes().to_vec(),
            Some("base64") => BASE64
                .decode(content)
                .map_err(|err| FsError::InvalidParams(format!("invalid base64 content: {err}")))?,
            Some(other) => {
                return Err(FsError::InvalidParams(format!("unsupported encoding `{other}`")))
            }
        };

        let full = self.validate_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| FsError::from_io(err, path))?;
        }
        fs::write(&full, &bytes)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        tracing::debug!(path, bytes = bytes.len(), "wrote file");

        Ok(json!({ "path": self.relative(&full), "bytes_written": bytes.len() }))
    }

    /// Runs one of the `list`, `read`, `write` operations with raw JSON
    /// params. Returns `None` for an unknown operation.
    pub async fn dispatch(&self, operation: &str, params: Value) -> Option<Result<Value, FsError>> {
        let outcome = match operation {
            "list" => match parse_params::<ListParams>(params) {
                Ok(p) => self.list(&p.path).await,
                Err(err) => Err(err),
            },
            "read" => match parse_params::<ReadParams>(params) {
                Ok(p) => self.read(&p.path).await,
                Err(err) => Err(err),
            },
            "write" => match parse_params::<WriteParams>(params) {
                Ok(p) => self.write(&p.path, &p.content, p.encoding.as_deref()).await,
                Err(err) => Err(err),
            },
            _ => return None,
        };
        Some(outcome)
    }
}

/// Tool catalog advertised through `tools/list`.
pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "list",
            "description": "List the entries of a directory relative to the root directory.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list", "default": "."}
                }
            }
        },
        {
            "name": "read",
            "description": "Read a file relative to the root directory. Binary content is returned base64 encoded.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File to read"}
                },
                "required": ["path"]
            }
        },
        {
            "name": "write",
            "description": "Write a file relative to the root directory, creating parent directories as needed.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File to write"},
                    "content": {"type": "string", "description": "Content to write"},
                    "encoding": {"type": "string", "enum": ["utf-8", "base64"]}
                },
                "required": ["path", "content"]
            }
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> (tempfile::TempDir, FilesystemServer) {
        let dir = tempfile::tempdir().unwrap();
        let server = FilesystemServer::new(dir.path(), false).unwrap();
        (dir, server)
    }

    #[test]
    fn missing_root_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilesystemServer::new(dir.path().join("nope"), false).err().unwrap();
        assert!(matches!(err, FsError::PathNotFound(_)));
    }

    #[test]
    fn rejects_paths_escaping_the_root() {
        let (_dir, server) = server();
        for path in ["../outside.txt", "a/../../b", "/etc/passwd"] {
            let err = server.validate_path(path).unwrap_err();
            assert!(matches!(err, FsError::InvalidPath(_)), "{path} should be rejected");
        }
        assert!(server.validate_path("a/../b.txt").is_ok());
        assert!(server.validate_path("new/dir/file.txt").is_ok());
    }

    #[test]
    fn sibling_with_shared_prefix_is_outside() {
        let parent = tempfile::tempdir().unwrap();
        std::fs::create_dir(parent.path().join("root")).unwrap();
        std::fs::create_dir(parent.path().join("root-other")).unwrap();
        let server = FilesystemServer::new(parent.path().join("root"), false).unwrap();
        assert!(server.validate_path("../root-other/x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_root_are_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let (dir, server) = server();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let err = server.validate_path("escape/secret.txt").unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn dangling_symlinks_out_of_the_root_are_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("pwned.txt");
        let (dir, server) = server();
        std::os::unix::fs::symlink(&target, dir.path().join("escape")).unwrap();

        let err = server.validate_path("escape").unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(ref msg) if msg == "Path outside root directory"));
        assert!(server.write("escape", "pwned", None).await.is_err());
        assert!(!target.exists());
    }

    #[test]
    fn dangling_symlinks_inside_the_root_resolve_to_their_target() {
        let (dir, server) = server();
        std::os::unix::fs::symlink("later/new.txt", dir.path().join("alias")).unwrap();
        let resolved = server.validate_path("alias").unwrap();
        assert_eq!(resolved, server.root().join("later/new.txt"));
    }

    #[test]
    fn symlink_loops_are_rejected() {
        let (dir, server) = server();
        std::os::unix::fs::symlink("b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();
        assert!(matches!(server.validate_path("a"), Err(FsError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn lists_entries_sorted_by_name() {
        let (dir, server) = server();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let listing = server.list(".").await.unwrap();
        let entries = listing["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "a");
        assert_eq!(entries[0]["type"], "directory");
        assert!(entries[0]["size"].is_null());
        assert_eq!(entries[1]["path"], "b.txt");
        assert_eq!(entries[1]["size"], 2);
    }

    #[tokio::test]
    async fn read_reports_missing_files_and_directories() {
        let (dir, server) = server();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(matches!(
            server.read("missing.txt").await,
            Err(FsError::PathNotFound(_))
        ));
        assert!(matches!(server.read("sub").await, Err(FsError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn writes_text_and_reads_it_back() {
        let (dir, server) = server();
        let out = server.write("nested/dir/note.txt", "hello", None).await.unwrap();
        assert_eq!(out["bytes_written"], 5);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/dir/note.txt")).unwrap(),
            "hello"
        );

        let read = server.read("nested/dir/note.txt").await.unwrap();
        assert_eq!(read["content"], "hello");
        assert_eq!(read["encoding"], "utf-8");
    }

    #[tokio::test]
    async fn binary_content_is_base64() {
        let (dir, server) = server();
        std::fs::write(dir.path().join("blob.bin"), [0xff, 0x00, 0xfe]).unwrap();
        let read = server.read("blob.bin").await.unwrap();
        assert_eq!(read["encoding"], "base64");
        assert_eq!(read["content"], "/wD+");

        server.write("copy.bin", "/wD+", Some("base64")).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("copy.bin")).unwrap(),
            vec![0xff, 0x00, 0xfe]
        );
    }

    #[tokio::test]
    async fn dispatch_validates_params() {
        let (_dir, server) = server();
        let outcome = server.dispatch("write", json!({"path": "x.txt"})).await.unwrap();
        assert!(matches!(outcome, Err(FsError::InvalidParams(_))));
        assert!(server.dispatch("delete", json!({})).await.is_none());

        let listing = server.dispatch("list", Value::Null).await.unwrap().unwrap();
        assert!(listing["entries"].as_array().unwrap().is_empty());
    }
}
