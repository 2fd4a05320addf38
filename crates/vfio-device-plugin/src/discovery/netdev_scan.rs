use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::sysfs;
use super::sysfs::SysfsLayout;
use super::types::DeviceRecord;
use super::types::DiscoveryError;
use super::DeviceDiscovery;

/// Enumerates network interfaces and the `virtfnN` links of their PCI device
/// (`/sys/class/net/<iface>/device/virtfnN`).
#[derive(Debug, Clone)]
pub struct NetdevScan {
    layout: SysfsLayout,
    driver: String,
}

impl NetdevScan {
    pub fn new(layout: SysfsLayout, driver: impl Into<String>) -> Self {
        Self {
            layout,
            driver: driver.into(),
        }
    }

    fn probe(
        &self,
        iface: &str,
        virtfn: &str,
        vf_index: u32,
    ) -> Result<DeviceRecord, Report<DiscoveryError>> {
        let vf_dir = self
            .layout
            .class_net_dir()
            .join(iface)
            .join("device")
            .join(virtfn);

        let pci_address = sysfs::link_basename(&vf_dir)
            .filter(|name| sysfs::is_valid_pci_address(name))
            .ok_or_else(|| {
                Report::new(DiscoveryError::Attribute {
                    pci_address: format!("{iface}/{virtfn}"),
                    attribute: "virtfn",
                })
            })?;

        let driver = sysfs::link_basename(&vf_dir.join("driver"));
        if driver.as_deref() != Some(self.driver.as_str()) {
            return Err(Report::new(DiscoveryError::NotBound {
                pci_address,
                driver: self.driver.clone(),
            })
            .attach_printable(format!("bound driver: {driver:?}")));
        }

        sysfs::probe_function(
            &self.layout,
            &vf_dir,
            &pci_address,
            iface.to_string(),
            vf_index,
        )
    }
}

impl DeviceDiscovery for NetdevScan {
    fn name(&self) -> &'static str {
        "netdev"
    }

    fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
        let root = self.layout.class_net_dir();
        info!("Scanning {} for virtual functions", root.display());

        let ifaces = sysfs::sorted_entries(&root).change_context_lazy(|| {
            DiscoveryError::ScanRoot {
                path: root.clone(),
            }
        })?;

        let mut devices = Vec::new();
        for iface in ifaces {
            // virtual interfaces such as `lo` have no backing PCI device
            let Ok(entries) = sysfs::sorted_entries(&root.join(&iface).join("device")) else {
                debug!("{iface} has no PCI device, skipping");
                continue;
            };

            let mut virtfns: Vec<(u32, String)> = entries
                .into_iter()
                .filter_map(|name| {
                    let index = name.strip_prefix("virtfn")?.parse::<u32>().ok()?;
                    Some((index, name))
                })
                .collect();
            virtfns.sort();

            for (vf_index, virtfn) in virtfns {
                match self.probe(&iface, &virtfn, vf_index) {
                    Ok(record) => {
                        info!(
                            pci = %record.pci_address,
                            vendor = %record.vendor_id,
                            device = %record.device_id,
                            iommu_group = %record.iommu_group,
                            pf = %record.pf_name,
                            vf = record.vf_index,
                            "Found PCI device"
                        );
                        devices.push(record);
                    }
                    Err(report)
                        if matches!(report.current_context(), DiscoveryError::NotBound { .. }) =>
                    {
                        debug!("Skipping {iface}/{virtfn}: {report}");
                    }
                    Err(report) => warn!("Skipping {iface}/{virtfn}: {report:?}"),
                }
            }
        }

        Ok(devices)
    }
}
