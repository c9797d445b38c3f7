//! Directory observation for disk-backed stores.
//!
//! Wraps a [`notify`] watcher into four event kinds delivered over a tokio
//! channel, filtered by file extension. The observer can be paused while the
//! owning store writes its own files, so those writes do not loop back as
//! reload events; `resume` waits out a short settling delay first, dropping
//! whatever the watcher observed in between.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Delay after a pause during which observed events are still discarded.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// A file-level event below the observed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Modified(PathBuf),
    Created(PathBuf),
    Deleted(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

/// Pause/resume handle, cloneable into the tasks which write files.
#[derive(Clone)]
pub struct PauseSwitch {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes event delivery after the settling delay; events observed
    /// while paused (and while settling) are dropped.
    pub async fn resume(&self) {
        tokio::time::sleep(SETTLE_DELAY).await;
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Scoped bracket: runs `work` with the observer paused.
    pub async fn while_paused<T, F>(&self, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.pause();
        let out = work.await;
        self.resume().await;
        out
    }
}

pub struct FilesystemObserver {
    switch: PauseSwitch,
    watcher: Option<RecommendedWatcher>,
    events: Option<mpsc::UnboundedReceiver<FsEvent>>,
    path: PathBuf,
}

impl FilesystemObserver {
    /// Starts observing `path` for files with one of the given extensions
    /// (without dot; an empty list observes everything).
    pub fn new(
        path: &Path,
        extensions: &[String],
        recursive: bool,
    ) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(false));

        let filter_paused = paused.clone();
        let filter_extensions = extensions.to_vec();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "filesystem observer error");
                        return;
                    }
                };
                if filter_paused.load(Ordering::SeqCst) {
                    return;
                }
                for mapped in map_event(&event, &filter_extensions) {
                    // Send failures mean the consumer is gone; nothing to do.
                    let _ = tx.send(mapped);
                }
            })?;
        watcher.watch(
            path,
            if recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            },
        )?;

        Ok(Self {
            switch: PauseSwitch { paused },
            watcher: Some(watcher),
            events: Some(rx),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn switch(&self) -> PauseSwitch {
        self.switch.clone()
    }

    /// Takes the event receiver; the consumer owns the read side.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<FsEvent>> {
        self.events.take()
    }

    /// Stops observing. The event channel closes once the watcher is gone.
    pub fn stop(&mut self) {
        self.watcher.take();
    }
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|want| want == e))
        .unwrap_or(false)
}

fn map_event(event: &Event, extensions: &[String]) -> Vec<FsEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                if matches_extension(&from, extensions) || matches_extension(&to, extensions) {
                    out.push(FsEvent::Moved { from, to });
                }
            }
            RenameMode::From => {
                for path in &event.paths {
                    if matches_extension(path, extensions) {
                        out.push(FsEvent::Deleted(path.clone()));
                    }
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    if matches_extension(path, extensions) {
                        out.push(FsEvent::Created(path.clone()));
                        // Renamed-in files carry their final content already.
                        out.push(FsEvent::Modified(path.clone()));
                    }
                }
            }
            _ => {
                for path in &event.paths {
                    if matches_extension(path, extensions) {
                        out.push(FsEvent::Modified(path.clone()));
                    }
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                if matches_extension(path, extensions) {
                    out.push(FsEvent::Modified(path.clone()));
                }
            }
        }
        EventKind::Create(_) => {
            for path in &event.paths {
                if matches_extension(path, extensions) {
                    out.push(FsEvent::Created(path.clone()));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if matches_extension(path, extensions) {
                    out.push(FsEvent::Deleted(path.clone()));
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<FsEvent>,
        want: impl Fn(&FsEvent) -> bool,
    ) -> FsEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("observer channel open");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected filesystem event in time")
    }

    #[tokio::test]
    async fn test_observes_modify_create_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut observer =
            FilesystemObserver::new(dir.path(), &["cfg".to_string()], false).unwrap();
        let mut rx = observer.take_events().unwrap();

        let file = dir.path().join("demo.cfg");
        std::fs::write(&file, "[a]\nb = 1\n").unwrap();
        next_event(&mut rx, |e| matches!(e, FsEvent::Created(p) if p == &file)).await;

        std::fs::write(&file, "[a]\nb = 2\n").unwrap();
        next_event(&mut rx, |e| matches!(e, FsEvent::Modified(p) if p == &file)).await;

        // Files with other extensions are filtered out.
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        std::fs::remove_file(&file).unwrap();
        next_event(&mut rx, |e| matches!(e, FsEvent::Deleted(p) if p == &file)).await;

        observer.stop();
    }

    #[tokio::test]
    async fn test_paused_events_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut observer =
            FilesystemObserver::new(dir.path(), &["cfg".to_string()], false).unwrap();
        let mut rx = observer.take_events().unwrap();
        let switch = observer.switch();

        switch
            .while_paused(async {
                std::fs::write(dir.path().join("own.cfg"), "[a]\nb = 1\n").unwrap();
                // Give the watcher time to observe the write while paused.
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
            .await;

        // Only the post-resume write arrives.
        let marker = dir.path().join("external.cfg");
        std::fs::write(&marker, "[a]\nb = 2\n").unwrap();
        let event = next_event(&mut rx, |e| {
            matches!(e, FsEvent::Created(_) | FsEvent::Modified(_))
        })
        .await;
        let path = match &event {
            FsEvent::Created(p) | FsEvent::Modified(p) => p.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(path, marker);

        observer.stop();
    }
}
