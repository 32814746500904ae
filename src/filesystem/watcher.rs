use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_full::notify::event::{ModifyKind, RenameMode};
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{FsError, CHANGE_METHOD};
use crate::mcp::JsonRpcNotification;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Debounced recursive watcher on the provider root.
pub(super) struct ChangeWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    pub(super) fn spawn(
        root: PathBuf,
        changes: broadcast::Sender<JsonRpcNotification>,
    ) -> Result<Self, FsError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|err| FsError::Watch(err.to_string()))?;
        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| FsError::Watch(err.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(events) => {
                        for event in events {
                            for (change_type, path) in classify(&root, &event.kind, &event.paths) {
                                let _ = changes.send(change_notification(change_type, &path));
                            }
                        }
                    }
                    Err(errors) => {
                        for err in errors {
                            tracing::warn!(error = %err, "filesystem watch error");
                        }
                    }
                }
            }
        });

        Ok(Self { debouncer, task })
    }

    pub(super) async fn stop(self) {
        let Self { debouncer, task } = self;
        drop(debouncer);
        task.abort();
        let _ = task.await;
    }
}

fn change_type(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("added"),
        EventKind::Remove(_) => Some("deleted"),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some("deleted"),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some("added"),
        EventKind::Modify(_) => Some("modified"),
        _ => None,
    }
}

/// Root-relative changes described by one event. Access events and paths
/// outside the root produce nothing.
fn classify(root: &Path, kind: &EventKind, paths: &[PathBuf]) -> Vec<(&'static str, String)> {
    let Some(change) = change_type(kind) else {
        return Vec::new();
    };
    // A rename carrying both ends reports the old path gone and the new one added.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = kind {
        if let [from, to] = paths {
            return [("deleted", from), ("added", to)]
                .into_iter()
                .filter_map(|(change, path)| relative(root, path).map(|p| (change, p)))
                .collect();
        }
    }
    paths
        .iter()
        .filter_map(|path| relative(root, path).map(|p| (change, p)))
        .collect()
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
}

fn change_notification(change_type: &str, path: &str) -> JsonRpcNotification {
    JsonRpcNotification::new(
        CHANGE_METHOD,
        Some(json!({
            "type": "filesystem_change",
            "change_type": change_type,
            "path": path,
        })),
    )
}
