//! File change detection
//!
//! Wraps a `notify` watcher and exposes write events as a [`Stream`]. Only
//! content writes count as changes; creates, removes, renames and attribute
//! updates are ignored.

use crate::error::{Error, Result};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, info};

/// A watched file was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

/// Whether a notify event is a content write
pub fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Stream of write events for a fixed set of paths.
///
/// Each path is watched non-recursively: a directory reports writes to its
/// direct entries. Dropping the watcher stops the OS subscription.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<Result<ChangeEvent>>,
}

impl ChangeWatcher {
    /// Register every path with the OS watch subsystem.
    ///
    /// Fails on the first path that cannot be watched (e.g. it does not exist).
    pub fn new(paths: &[PathBuf]) -> Result<Self> {
        let (tx, events) = mpsc::unbounded();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let item = match res {
                Ok(event) if is_write(&event.kind) => {
                    let Some(path) = event.paths.into_iter().next() else {
                        return;
                    };
                    Ok(ChangeEvent { path })
                }
                Ok(_) => return,
                Err(e) => Err(Error::Watch(e)),
            };
            // Receiver gone means the watcher is being torn down
            let _ = tx.unbounded_send(item);
        })
        .map_err(Error::Watch)?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|source| Error::WatchSetup {
                    path: path.clone(),
                    source,
                })?;
            debug!(path = %path.display(), "Watching");
        }
        info!(count = paths.len(), "File watcher started");

        Ok(Self {
            _watcher: watcher,
            events,
        })
    }
}

impl Stream for ChangeWatcher {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}
