//! Lifecycle controller.
//!
//! Owns every [`PluginInstance`] and runs the restart loop: stop all servers,
//! rediscover devices, then serve each instance in turn. A cycle that fails
//! part way is retried from scratch rather than resumed, so the kubelet never
//! sees a half registered set of resources.

pub mod events;
pub mod instance;

use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

pub use events::ControlEvent;
pub use events::EventSources;
pub use events::RestartReason;
pub use instance::PluginInstance;

use crate::config::PluginConfig;
use crate::discovery::Discovery;

/// Errors that end the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Failed to watch {path}")]
    Watcher { path: PathBuf },
    #[error("Failed to register signal handler")]
    Signal,
    #[error("Device discovery failed")]
    Discovery,
}

/// Where instances are published and how failed cycles are paced.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub resource_namespace: String,
    pub plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub retry_interval: Duration,
}

impl From<&PluginConfig> for ControllerSettings {
    fn from(config: &PluginConfig) -> Self {
        Self {
            resource_namespace: config.resource_namespace.clone(),
            plugin_dir: config.plugin_dir.clone(),
            kubelet_socket: config.kubelet_socket_path(),
            retry_interval: config.retry_interval(),
        }
    }
}

pub struct Controller {
    discovery: Discovery,
    settings: ControllerSettings,
    instances: Vec<PluginInstance>,
}

impl Controller {
    pub fn new(discovery: Discovery, settings: ControllerSettings) -> Self {
        Self {
            discovery,
            settings,
            instances: Vec::new(),
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self::new(Discovery::from_config(config), config.into())
    }

    pub fn instances(&self) -> &[PluginInstance] {
        &self.instances
    }

    /// Run one restart cycle.
    ///
    /// Returns `Ok(false)` when an instance failed to start or register; that
    /// instance is stopped and the rest of the cycle skipped.
    pub async fn restart_cycle(&mut self) -> Result<bool, Report<ControllerError>> {
        self.stop_all().await;

        let devices = self
            .discovery
            .scan()
            .change_context(ControllerError::Discovery)?;
        if devices.is_empty() {
            warn!("No passthrough devices found, nothing to advertise");
        }

        self.instances = devices
            .into_iter()
            .map(|record| {
                PluginInstance::new(
                    record,
                    &self.settings.resource_namespace,
                    &self.settings.plugin_dir,
                )
            })
            .collect();

        for instance in &mut self.instances {
            if let Err(e) = instance.serve(&self.settings.kubelet_socket).await {
                warn!(
                    "Failed to serve {}, retrying the whole cycle: {e:#}",
                    instance.resource_name()
                );
                return Ok(false);
            }
        }

        info!("Serving {} device plugin(s)", self.instances.len());
        Ok(true)
    }

    /// Stop every live server. Each stop is independent of the others.
    pub async fn stop_all(&mut self) {
        for instance in &mut self.instances {
            instance.stop().await;
        }
    }

    pub async fn shutdown(&mut self) {
        info!("Stopping {} device plugin(s)", self.instances.len());
        self.stop_all().await;
    }

    /// Drive restart cycles from `events` until a shutdown event arrives or
    /// every sender is gone.
    pub async fn run(
        &mut self,
        events: &mut mpsc::Receiver<ControlEvent>,
    ) -> Result<(), Report<ControllerError>> {
        let mut pending = Some(RestartReason::Startup);

        loop {
            if let Some(reason) = pending {
                info!("Restarting device plugins ({reason})");
                match self.restart_cycle().await {
                    Ok(true) => pending = None,
                    Ok(false) => warn!(
                        "Failed to contact kubelet, retrying in {:?}",
                        self.settings.retry_interval
                    ),
                    Err(report) => {
                        self.shutdown().await;
                        return Err(report);
                    }
                }
            }

            let event = if pending.is_some() {
                tokio::select! {
                    event = events.recv() => event,
                    _ = tokio::time::sleep(self.settings.retry_interval) => continue,
                }
            } else {
                events.recv().await
            };

            match event {
                Some(ControlEvent::Restart(reason)) => pending = Some(reason),
                Some(ControlEvent::Shutdown(signal)) => {
                    info!("Received signal '{signal}', shutting down");
                    self.shutdown().await;
                    return Ok(());
                }
                None => {
                    info!("Event sources closed, shutting down");
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}
