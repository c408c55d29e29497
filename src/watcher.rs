//! Content-addressed file watcher.
//!
//! Watches a single file and hands `(previous, current)` byte buffers to a
//! handler whenever the content actually changes. Touch-only events are
//! swallowed by an exact byte-equality gate. A diff can also be triggered
//! manually; forcing one treats the previously read bytes as empty, which
//! re-emits the full current content through the handler.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, warn};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

// Grace period for files that momentarily disappear during atomic
// replacement.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);
const READ_RETRY_ATTEMPTS: u32 = 100;

/// Handle for triggering manual diffs on a running [`FileWatcher`].
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::Sender<bool>,
}

impl WatcherHandle {
    /// Manually triggers a diff. With `force` the previously read bytes
    /// are treated as empty and the equality gate is bypassed.
    pub async fn diff(&self, force: bool) {
        let _ = self.tx.send(force).await;
    }
}

/// A file that can be watched for content changes.
pub struct FileWatcher {
    path: PathBuf,
    tx: mpsc::Sender<bool>,
    rx: mpsc::Receiver<bool>,
    // kept alive for the duration of the watch; dropping it unregisters
    // the OS watch
    _watcher: notify::RecommendedWatcher,
    last_read: Vec<u8>,
}

impl FileWatcher {
    /// Registers a watch for the provided file. The file's parent
    /// directory is observed so the watch survives atomic replacement.
    pub fn new(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .context("watched path has no file name")?
            .to_os_string();

        let (tx, rx) = mpsc::channel(16);

        let event_tx = tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        if event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()))
                        {
                            // full backlog means a diff is already pending
                            let _ = event_tx.try_send(false);
                        }
                    }
                    Err(e) => error!("File watch error: {}", e),
                }
            })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            tx,
            rx,
            _watcher: watcher,
            last_read: Vec::new(),
        })
    }

    /// Returns a handle for triggering manual diffs.
    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            tx: self.tx.clone(),
        }
    }

    /// Blocks the caller and invokes `handler` with `(previous, current)`
    /// bytes for every content change until every handle is gone.
    pub async fn watch<F, Fut>(mut self, mut handler: F)
    where
        F: FnMut(Vec<u8>, Vec<u8>) -> Fut,
        Fut: Future<Output = ()>,
    {
        // the watcher holds its own event sender, so the channel never
        // closes on its own; the loop ends with the surrounding task
        while let Some(force) = self.rx.recv().await {
            if force {
                self.last_read.clear();
            }

            let content = match read_when_present(&self.path).await {
                Ok(content) => content,
                Err(e) => {
                    error!("Could not read watched file {}: {}", self.path.display(), e);
                    continue;
                }
            };

            if !force && content == self.last_read {
                continue;
            }

            handler(self.last_read.clone(), content.clone()).await;

            self.last_read = content;
        }
    }
}

async fn read_when_present(path: &Path) -> Result<Vec<u8>> {
    let mut attempts = 0;

    loop {
        match tokio::fs::read(path).await {
            Ok(content) => return Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempts < READ_RETRY_ATTEMPTS => {
                attempts += 1;
                if attempts == 1 {
                    warn!("Watched file {} momentarily absent", path.display());
                }
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const SETTLE: Duration = Duration::from_millis(200);

    fn spawn_watcher(
        path: &Path,
    ) -> (WatcherHandle, mpsc::Receiver<(Vec<u8>, Vec<u8>)>) {
        let watcher = FileWatcher::new(path).expect("watcher");
        let handle = watcher.handle();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(watcher.watch(move |prev, curr| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((prev, curr)).await;
            }
        }));

        (handle, rx)
    }

    #[tokio::test]
    async fn manual_diff_reports_content_once() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "v1").expect("write");
        file.flush().expect("flush");

        let (handle, mut rx) = spawn_watcher(file.path());

        handle.diff(false).await;
        let (prev, curr) = timeout(WAIT, rx.recv()).await.expect("diff").expect("open");
        assert!(prev.is_empty());
        assert_eq!(curr, b"v1");

        // unchanged content invokes no handler
        handle.diff(false).await;
        assert!(timeout(SETTLE, rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn forced_diff_treats_previous_bytes_as_empty() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "v1").expect("write");
        file.flush().expect("flush");

        let (handle, mut rx) = spawn_watcher(file.path());

        handle.diff(false).await;
        timeout(WAIT, rx.recv()).await.expect("diff").expect("open");

        handle.diff(true).await;
        let (prev, curr) = timeout(WAIT, rx.recv()).await.expect("diff").expect("open");
        assert!(prev.is_empty());
        assert_eq!(curr, b"v1");
    }

    #[tokio::test]
    async fn file_change_triggers_handler() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("desired.json");
        std::fs::write(&path, b"v1").expect("write");

        let (_handle, mut rx) = spawn_watcher(&path);

        std::fs::write(&path, b"v2").expect("write");

        let (prev, curr) = timeout(WAIT, rx.recv()).await.expect("event").expect("open");
        // the first observed change may fold the initial content in,
        // depending on how the OS batches the events
        assert!(prev.is_empty() || prev == b"v1");
        assert_eq!(curr, b"v2");
    }
}
