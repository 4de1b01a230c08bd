//! Hot-reload file watcher.
//!
//! Watches the directory containing the config file (editors and installers
//! replace files by atomic rename, which per-file watches miss on some
//! platforms), filters events down to the config file name, debounces
//! bursts, and hands each *changed* parse result to the listener. Reloads
//! never overlap: events arriving while the listener runs queue up and
//! trigger exactly one follow-up reload.

use crate::config::{BridgeConfig, DEFAULT_DEBOUNCE_MS, load_config};
use crate::diff::config_fingerprint;
use crate::error::{BridgeError, Result};
use futures::future::BoxFuture;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Called with each successfully loaded, changed config.
pub type ReloadListener =
    Arc<dyn Fn(BridgeConfig) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct ConfigWatcher {
    path: PathBuf,
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    shutdown: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching `path` with the default 500 ms debounce.
    pub fn spawn(
        path: &Path,
        initial: &BridgeConfig,
        listener: ReloadListener,
    ) -> Result<Self> {
        Self::spawn_with_debounce(
            path,
            initial,
            listener,
            Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        )
    }

    pub fn spawn_with_debounce(
        path: &Path,
        initial: &BridgeConfig,
        listener: ReloadListener,
        debounce: Duration,
    ) -> Result<Self> {
        let path = path
            .canonicalize()
            .map_err(|e| BridgeError::Config(format!("cannot resolve {}: {e}", path.display())))?;
        let dir = path
            .parent()
            .ok_or_else(|| {
                BridgeError::Config(format!("{} has no parent directory", path.display()))
            })?
            .to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| BridgeError::Config(format!("{} has no file name", path.display())))?
            .to_os_string();

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        let _ = event_tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "file watcher error"),
            }
        })
        .map_err(|e| BridgeError::Config(format!("cannot create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                BridgeError::Config(format!("cannot watch {}: {e}", dir.display()))
            })?;

        tracing::info!(config = %path.display(), "watching config file for changes");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reload_loop(
            path.clone(),
            config_fingerprint(initial),
            listener,
            event_rx,
            debounce,
            shutdown.clone(),
        ));

        Ok(Self {
            path,
            _watcher: watcher,
            shutdown,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop watching and wait for the reload task to wind down.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn reload_loop(
    path: PathBuf,
    mut fingerprint: String,
    listener: ReloadListener,
    mut events: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                if event.is_none() {
                    return;
                }
            }
            () = shutdown.cancelled() => return,
        }

        // Debounce: swallow further events until the file has been quiet
        // for the whole window. Events arriving during a reload are already
        // queued on the channel and start the next round.
        loop {
            tokio::select! {
                event = tokio::time::timeout(debounce, events.recv()) => {
                    match event {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }

        match load_config(&path) {
            Ok(config) => {
                let next_fingerprint = config_fingerprint(&config);
                if next_fingerprint == fingerprint {
                    tracing::debug!("config file touched but unchanged, skipping reload");
                    continue;
                }
                tracing::info!(config = %path.display(), "config file changed, reloading");
                fingerprint = next_fingerprint;
                if let Err(e) = listener(config).await {
                    tracing::error!(error = %e, "reload listener failed");
                }
            }
            Err(e) => {
                // Keep running with the old config; the next save retries.
                tracing::error!(error = %e, "config reload failed, keeping previous config");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_DEBOUNCE: Duration = Duration::from_millis(100);

    struct ReloadProbe {
        count: Arc<AtomicUsize>,
        last: Arc<parking_lot::Mutex<Option<BridgeConfig>>>,
    }

    fn probe_listener() -> (ReloadProbe, ReloadListener) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(parking_lot::Mutex::new(None));
        let listener: ReloadListener = {
            let count = Arc::clone(&count);
            let last = Arc::clone(&last);
            Arc::new(move |config| {
                count.fetch_add(1, Ordering::SeqCst);
                *last.lock() = Some(config);
                async { Ok(()) }.boxed()
            })
        };
        (ReloadProbe { count, last }, listener)
    }

    async fn wait_for_reloads(probe: &ReloadProbe, expected: usize) {
        for _ in 0..100 {
            if probe.count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "expected {expected} reloads, saw {}",
            probe.count.load(Ordering::SeqCst)
        );
    }

    fn write_config(path: &Path, body: &str) {
        std::fs::write(path, body).expect("write config");
    }

    #[tokio::test]
    async fn burst_of_events_causes_one_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.json");
        write_config(&path, r#"{ "servers": {} }"#);
        let initial = load_config(&path).expect("initial config");

        let (probe, listener) = probe_listener();
        let watcher =
            ConfigWatcher::spawn_with_debounce(&path, &initial, listener, TEST_DEBOUNCE)
                .expect("spawn watcher");

        // Several writes inside one debounce window.
        for i in 0..5 {
            write_config(
                &path,
                &format!(r#"{{ "servers": {{ "s{i}": {{ "command": "node" }} }} }}"#),
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        wait_for_reloads(&probe, 1).await;
        tokio::time::sleep(TEST_DEBOUNCE * 3).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 1);

        let seen = probe.last.lock().clone().expect("config delivered");
        assert!(seen.resolve_upstreams().contains_key("s4"));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn unchanged_content_does_not_invoke_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.json");
        let body = r#"{ "servers": { "a": { "command": "node" } } }"#;
        write_config(&path, body);
        let initial = load_config(&path).expect("initial config");

        let (probe, listener) = probe_listener();
        let watcher =
            ConfigWatcher::spawn_with_debounce(&path, &initial, listener, TEST_DEBOUNCE)
                .expect("spawn watcher");

        // Rewrite byte-identical content.
        write_config(&path, body);
        tokio::time::sleep(TEST_DEBOUNCE * 4).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 0);

        // A semantically identical rewrite with different key order is also
        // a no-op.
        write_config(
            &path,
            r#"{ "servers": { "a": { "args": [], "command": "node" } } }"#,
        );
        tokio::time::sleep(TEST_DEBOUNCE * 4).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 0);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_keeps_watcher_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.json");
        write_config(&path, r#"{ "servers": {} }"#);
        let initial = load_config(&path).expect("initial config");

        let (probe, listener) = probe_listener();
        let watcher =
            ConfigWatcher::spawn_with_debounce(&path, &initial, listener, TEST_DEBOUNCE)
                .expect("spawn watcher");

        write_config(&path, "{ not json at all");
        tokio::time::sleep(TEST_DEBOUNCE * 4).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 0);

        // The watcher survives and picks up the next valid save.
        write_config(&path, r#"{ "servers": { "b": { "command": "node" } } }"#);
        wait_for_reloads(&probe, 1).await;

        watcher.stop().await;
    }

    #[tokio::test]
    async fn atomic_rename_replacement_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.json");
        write_config(&path, r#"{ "servers": {} }"#);
        let initial = load_config(&path).expect("initial config");

        let (probe, listener) = probe_listener();
        let watcher =
            ConfigWatcher::spawn_with_debounce(&path, &initial, listener, TEST_DEBOUNCE)
                .expect("spawn watcher");

        // Write-then-rename, the way editors save.
        let tmp = dir.path().join("bridge.json.tmp");
        write_config(&tmp, r#"{ "servers": { "c": { "command": "node" } } }"#);
        std::fs::rename(&tmp, &path).expect("rename over config");

        wait_for_reloads(&probe, 1).await;
        watcher.stop().await;
    }
}
