//! Hot-reload lifecycle worker (spec §5/§6).
//!
//! SIGHUP and SIGUSR1 both request a reload; the work itself happens off the signal-handling
//! task through a bounded channel so a storm of overlapping signals collapses into at most
//! one reload attempt waiting behind the one in progress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use pingora::server::{ListenFds, ShutdownWatch};
use pingora::services::Service;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::Config;

use super::plugin::PluginCreateFn;
use super::snapshot::ConfigStore;

pub struct ReloadWorker {
    conf_path: PathBuf,
    store: Arc<ConfigStore>,
    registry: &'static HashMap<&'static str, PluginCreateFn>,
}

impl ReloadWorker {
    pub fn new(
        conf_path: PathBuf,
        store: Arc<ConfigStore>,
        registry: &'static HashMap<&'static str, PluginCreateFn>,
    ) -> Self {
        Self {
            conf_path,
            store,
            registry,
        }
    }

    fn reload_once(&self) {
        let path = self.conf_path.to_string_lossy().to_string();
        match Config::load_from_yaml(&path) {
            Ok(config) => match self.store.reload(&config, self.registry) {
                Ok(()) => log::info!("configuration reloaded from {path}"),
                Err(e) => log::error!("reload rejected, keeping previous snapshot: {e}"),
            },
            Err(e) => log::error!("failed to read/parse configuration for reload: {e}"),
        }
    }
}

#[async_trait]
impl Service for ReloadWorker {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        let mut user1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGUSR1 handler: {e}");
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<()>(1);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown signal received, stopping config reload worker");
                        break;
                    }
                },
                _ = hangup.recv() => {
                    let _ = tx.try_send(());
                },
                _ = user1.recv() => {
                    let _ = tx.try_send(());
                },
                Some(()) = rx.recv() => {
                    self.reload_once();
                },
            }
        }
    }

    fn name(&self) -> &'static str {
        "config reload"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
