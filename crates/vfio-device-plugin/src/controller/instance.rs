use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::discovery::DeviceRecord;
use crate::k8s::naming;
use crate::k8s::PluginState;
use crate::k8s::VfioDevicePlugin;

/// The controller's view of one device and its plugin server.
#[derive(Debug)]
pub struct PluginInstance {
    record: DeviceRecord,
    resource_name: String,
    socket_path: PathBuf,
    /// live server, `None` until the first serve of this instance
    plugin: Option<VfioDevicePlugin>,
}

impl PluginInstance {
    pub fn new(record: DeviceRecord, namespace: &str, plugin_dir: &Path) -> Self {
        let resource_name = naming::resource_name(namespace, &record.pf_name, record.vf_index);
        let socket_path = naming::socket_path(plugin_dir, &resource_name);
        Self {
            record,
            resource_name,
            socket_path,
            plugin: None,
        }
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// State of the current server, `None` if none was ever created.
    pub fn state(&self) -> Option<PluginState> {
        self.plugin.as_ref().map(VfioDevicePlugin::state)
    }

    /// Create a fresh server for this instance, start and register it.
    pub(crate) async fn serve(&mut self, kubelet_socket: &Path) -> anyhow::Result<()> {
        self.stop().await;

        let plugin = self.plugin.insert(VfioDevicePlugin::new(
            self.resource_name.clone(),
            self.socket_path.clone(),
            self.record.pci_address.clone(),
            self.record.iommu_group.clone(),
        ));
        plugin.serve(kubelet_socket).await
    }

    /// Stop the live server; failures are logged, never returned.
    pub(crate) async fn stop(&mut self) {
        if let Some(plugin) = self.plugin.as_mut() {
            if let Err(e) = plugin.stop().await {
                warn!("Failed to stop device plugin {}: {e:#}", self.resource_name);
            }
        }
    }
}
