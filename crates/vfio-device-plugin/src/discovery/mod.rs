//! Device discovery.
//!
//! Turns the sysfs view of the host into [`DeviceRecord`]s, one per virtual
//! function that is bound to the passthrough driver and has a usable IOMMU
//! group device node. Two walks are available behind [`DeviceDiscovery`]:
//! - [`DriverDirectoryScan`]: starts from the driver directory (default)
//! - [`NetdevScan`]: starts from the network interfaces
//!
//! A failure to read the walk's root aborts the scan, a failure on a single
//! device only skips that device.

pub mod driver_scan;
pub mod netdev_scan;
pub mod sysfs;
pub mod types;

use std::collections::HashMap;
use std::collections::HashSet;

use error_stack::Report;
use tracing::info;
use tracing::warn;

pub use driver_scan::DriverDirectoryScan;
pub use netdev_scan::NetdevScan;
pub use sysfs::SysfsLayout;
pub use types::DeviceRecord;
pub use types::DiscoveryError;

use crate::config::DiscoveryStrategyKind;
use crate::config::PluginConfig;

/// A way of walking the platform topology.
pub trait DeviceDiscovery: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Produce the records found by one complete walk.
    fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>>;
}

/// Runs a discovery strategy and normalizes its output.
pub struct Discovery {
    strategy: Box<dyn DeviceDiscovery>,
    vendor_allow_list: Vec<String>,
}

impl Discovery {
    pub fn new(strategy: Box<dyn DeviceDiscovery>) -> Self {
        Self {
            strategy,
            vendor_allow_list: Vec::new(),
        }
    }

    /// Only advertise devices from these vendors, an empty list allows all.
    pub fn with_vendor_allow_list(mut self, vendors: &[String]) -> Self {
        self.vendor_allow_list = vendors.iter().map(|v| normalize_hex_id(v)).collect();
        self
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        let layout = SysfsLayout::new(&config.sysfs_root, &config.dev_root);
        let strategy: Box<dyn DeviceDiscovery> = match config.discovery_strategy {
            DiscoveryStrategyKind::Driver => {
                Box::new(DriverDirectoryScan::new(layout, &config.driver))
            }
            DiscoveryStrategyKind::Netdev => Box::new(NetdevScan::new(layout, &config.driver)),
        };
        Self::new(strategy).with_vendor_allow_list(&config.vendor_allow_list)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Scan the host, dropping disallowed vendors, duplicate addresses and
    /// functions that would share a resource name.
    ///
    /// Records are ordered by PCI address and the lowest address wins a
    /// conflict.
    pub fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
        let mut devices: Vec<DeviceRecord> = self
            .strategy
            .scan()?
            .into_iter()
            .filter(|device| {
                if self.is_vendor_allowed(&device.vendor_id) {
                    return true;
                }
                info!(
                    "Skipping {}: vendor {} is not allowed",
                    device.pci_address, device.vendor_id
                );
                false
            })
            .collect();
        devices.sort_by(|a, b| a.pci_address.cmp(&b.pci_address));

        let mut addresses = HashSet::new();
        let mut functions = HashMap::new();
        let result: Vec<DeviceRecord> = devices
            .into_iter()
            .filter(|device| {
                if !addresses.insert(device.pci_address.clone()) {
                    warn!("Ignoring duplicate record for {}", device.pci_address);
                    return false;
                }
                // the pair names the resource and its socket
                let key = (device.pf_name.clone(), device.vf_index);
                if let Some(owner) = functions.get(&key) {
                    warn!(
                        "Skipping {}: {} vf {} is already advertised for {owner}",
                        device.pci_address, device.pf_name, device.vf_index
                    );
                    return false;
                }
                functions.insert(key, device.pci_address.clone());
                true
            })
            .collect();

        info!(
            "Discovered {} passthrough device(s) with {} scan",
            result.len(),
            self.strategy.name()
        );
        Ok(result)
    }

    fn is_vendor_allowed(&self, vendor_id: &str) -> bool {
        self.vendor_allow_list.is_empty()
            || self
                .vendor_allow_list
                .iter()
                .any(|allowed| *allowed == normalize_hex_id(vendor_id))
    }
}

fn normalize_hex_id(id: &str) -> String {
    let id = id.trim().to_ascii_lowercase();
    id.strip_prefix("0x").unwrap_or(&id).to_string()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::sysfs::testing::FakeHost;
    use super::sysfs::testing::FakeVf;
    use super::*;
    use crate::k8s::naming;

    struct FixedScan(Vec<DeviceRecord>);

    impl DeviceDiscovery for FixedScan {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
            Ok(self.0.clone())
        }
    }

    fn record(pci_address: &str, vendor_id: &str, vf_index: u32) -> DeviceRecord {
        DeviceRecord {
            pci_address: pci_address.to_string(),
            vendor_id: vendor_id.to_string(),
            device_id: "154c".to_string(),
            iommu_group: "12".to_string(),
            pf_name: "eth0".to_string(),
            vf_index,
        }
    }

    #[test]
    fn orders_and_deduplicates_by_address() {
        let discovery = Discovery::new(Box::new(FixedScan(vec![
            record("0000:01:00.2", "8086", 2),
            record("0000:01:00.0", "8086", 0),
            record("0000:01:00.2", "8086", 2),
        ])));

        let devices = discovery.scan().expect("should scan");
        let addresses: Vec<_> = devices.iter().map(|d| d.pci_address.as_str()).collect();
        assert_eq!(addresses, vec!["0000:01:00.0", "0000:01:00.2"]);
    }

    #[test]
    fn repeated_vf_index_keeps_lowest_address() {
        let mut other_pf = record("0000:02:00.0", "8086", 0);
        other_pf.pf_name = "eth1".to_string();
        let discovery = Discovery::new(Box::new(FixedScan(vec![
            record("0000:01:01.0", "8086", 0),
            record("0000:01:00.0", "8086", 0),
            other_pf,
        ])));

        let devices = discovery.scan().expect("should scan");
        let addresses: Vec<_> = devices.iter().map(|d| d.pci_address.as_str()).collect();
        assert_eq!(addresses, vec!["0000:01:00.0", "0000:02:00.0"]);
    }

    #[test]
    fn unlisted_function_never_shares_a_socket() {
        let host = FakeHost::new();
        host.add_vf(&FakeVf::new("0000:01:00.0", 0, "12"));
        host.add_vf(&FakeVf::new("0000:01:01.0", 8, "20"));
        // function number 0 collides with the first VF
        host.remove("sys/devices/pci0000:00/0000:01:00.7/virtfn8");

        let devices = Discovery::new(Box::new(DriverDirectoryScan::new(
            host.layout(),
            "vfio-pci",
        )))
        .scan()
        .expect("should scan driver dir");

        let sockets: HashSet<_> = devices
            .iter()
            .map(|d| {
                let name = naming::resource_name("kr-vf", &d.pf_name, d.vf_index);
                naming::socket_path(Path::new("/plugins"), &name)
            })
            .collect();
        assert_eq!(sockets.len(), devices.len());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].pci_address, "0000:01:00.0");
    }

    #[test]
    fn vendor_allow_list_filters_records() {
        let discovery = Discovery::new(Box::new(FixedScan(vec![
            record("0000:01:00.0", "8086", 0),
            record("0000:02:00.0", "15b3", 1),
        ])))
        .with_vendor_allow_list(&["0x15B3".to_string()]);

        let devices = discovery.scan().expect("should scan");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].pci_address, "0000:02:00.0");
    }

    #[test]
    fn config_selects_strategy() {
        let config = PluginConfig::default();
        assert_eq!(Discovery::from_config(&config).strategy_name(), "driver");

        let config = PluginConfig {
            discovery_strategy: DiscoveryStrategyKind::Netdev,
            ..PluginConfig::default()
        };
        assert_eq!(Discovery::from_config(&config).strategy_name(), "netdev");
    }

    #[test]
    fn both_strategies_agree_on_a_host() {
        let host = FakeHost::new();
        host.add_vf(&FakeVf::new("0000:01:00.0", 0, "12"));
        host.add_vf(&FakeVf::new("0000:01:00.1", 1, "13"));

        let by_driver = Discovery::new(Box::new(DriverDirectoryScan::new(
            host.layout(),
            "vfio-pci",
        )))
        .scan()
        .expect("should scan driver dir");
        let by_netdev = Discovery::new(Box::new(NetdevScan::new(host.layout(), "vfio-pci")))
            .scan()
            .expect("should scan netdevs");

        assert_eq!(by_driver, by_netdev);
        assert_eq!(by_driver.len(), 2);
    }
}
