//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ConfigData;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the telemetry config file and publishes every valid change.
///
/// Editors usually emit several events per save; a document equal to the
/// last published one is not sent again.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Option<ConfigData>,
    update_tx: mpsc::UnboundedSender<ConfigData>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ConfigData>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            current: None,
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Treat `config` as already published.
    pub fn with_current(mut self, config: ConfigData) -> Self {
        self.current = Some(config);
        self
    }

    /// Start watching. Events stop when the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut reload = Reload {
            path: self.path,
            last: self.current,
            tx: self.update_tx,
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => reload.on_event(&event),
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

/// Reload state owned by the watch callback.
struct Reload {
    path: PathBuf,
    last: Option<ConfigData>,
    tx: mpsc::UnboundedSender<ConfigData>,
}

impl Reload {
    fn on_event(&mut self, event: &Event) {
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return;
        }
        let config = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    path = ?self.path,
                    error = %e,
                    "Invalid telemetry config, keeping current configuration"
                );
                return;
            }
        };
        if self.last.as_ref() == Some(&config) {
            tracing::debug!(path = ?self.path, "Telemetry config unchanged");
            return;
        }
        tracing::info!(path = ?self.path, "Telemetry config changed, reloading");
        if self.tx.send(config.clone()).is_ok() {
            self.last = Some(config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, ModifyKind};

    fn reload(name: &str) -> (Reload, mpsc::UnboundedReceiver<ConfigData>, PathBuf) {
        let path = std::env::temp_dir().join(format!("watcher-{}-{name}", std::process::id()));
        let (tx, rx) = mpsc::unbounded_channel();
        let reload = Reload {
            path: path.clone(),
            last: None,
            tx,
        };
        (reload, rx, path)
    }

    #[test]
    fn test_publishes_changes_once() {
        let (mut reload, mut rx, path) = reload("once.json");
        std::fs::write(&path, r#"{"service_name": "edge"}"#).unwrap();

        let modified = Event::new(EventKind::Modify(ModifyKind::Any));
        reload.on_event(&modified);
        reload.on_event(&modified);
        assert_eq!(rx.try_recv().unwrap().service_name, "edge");
        assert!(rx.try_recv().is_err());

        std::fs::write(&path, r#"{"service_name": "core"}"#).unwrap();
        reload.on_event(&Event::new(EventKind::Create(CreateKind::File)));
        assert_eq!(rx.try_recv().unwrap().service_name, "core");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_current_config_is_not_republished() {
        let path = std::env::temp_dir().join(format!("watcher-{}-current.json", std::process::id()));
        std::fs::write(&path, r#"{"service_name": "edge"}"#).unwrap();
        let current = load_config(&path).unwrap();
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let watcher = watcher.with_current(current);
        let mut reload = Reload {
            path: watcher.path,
            last: watcher.current,
            tx: watcher.update_tx,
        };

        reload.on_event(&Event::new(EventKind::Modify(ModifyKind::Any)));
        assert!(rx.try_recv().is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_invalid_document_is_not_published() {
        let (mut reload, mut rx, path) = reload("invalid.json");
        std::fs::write(&path, r#"{"trace_sample_rate": "#).unwrap();
        reload.on_event(&Event::new(EventKind::Modify(ModifyKind::Any)));
        assert!(rx.try_recv().is_err());
        assert!(reload.last.is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_other_events_are_ignored() {
        let (mut reload, mut rx, path) = reload("ignored.json");
        std::fs::write(&path, "{}").unwrap();
        reload.on_event(&Event::new(EventKind::Access(notify::event::AccessKind::Any)));
        assert!(rx.try_recv().is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
