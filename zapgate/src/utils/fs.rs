//! Filesystem helpers: confined joins, workdir lifecycle, file waiting.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Join `name` onto `base`, guaranteeing the result stays inside `base`.
///
/// Only a single, normal path component is accepted; separators, parent
/// references, absolute paths, and empty names are rejected. Segment names
/// arrive straight from the URL path, so this is the traversal gate.
pub fn secure_join(base: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('\\') {
        return Err(Error::session(format!("invalid segment name {name:?}")));
    }

    let candidate = Path::new(name);
    let mut components = candidate.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(base.join(name)),
        _ => Err(Error::session(format!("invalid segment name {name:?}"))),
    }
}

/// Remove and recreate a directory, giving the caller a clean workdir.
pub async fn reset_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Wait until `path` exists with non-zero size.
///
/// Uses filesystem notifications on the parent directory when available and
/// falls back to pure polling; either way a coarse poll tick guards against
/// missed events. Cancellable by `cancel`; bounded by `timeout`.
pub async fn wait_for_file(
    path: &Path,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    if file_has_bytes(path).await {
        return Ok(());
    }

    // Keep a sender alive locally so `recv` parks instead of draining `None`
    // when the watcher could not be set up.
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<()>(8);
    let _watcher = spawn_watcher(path, notify_tx.clone());

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(format!("file {} did not appear", path.display())));
            }
            _ = notify_rx.recv() => {}
            _ = tokio::time::sleep(poll) => {}
        }

        if file_has_bytes(path).await {
            return Ok(());
        }
    }
}

async fn file_has_bytes(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0)
}

/// Best-effort watcher on the file's parent directory. `None` (polling only)
/// when the platform watcher cannot be set up.
fn spawn_watcher(
    path: &Path,
    tx: tokio::sync::mpsc::Sender<()>,
) -> Option<notify::RecommendedWatcher> {
    let parent = path.parent()?;

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.try_send(());
        }
    })
    .ok()?;

    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        debug!(path = %parent.display(), error = %e, "fs watcher unavailable, polling only");
        return None;
    }

    Some(watcher)
}
