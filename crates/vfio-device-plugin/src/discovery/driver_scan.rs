use std::fs;
use std::path::Path;

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

/// Enumerates the functions bound to the passthrough driver
/// (`/sys/bus/pci/drivers/<driver>/<bdf>`).
#[derive(Debug, Clone)]
pub struct DriverDirectoryScan {
    layout: SysfsLayout,
    driver: String,
}

impl DriverDirectoryScan {
    pub fn new(layout: SysfsLayout, driver: impl Into<String>) -> Self {
        Self {
            layout,
            driver: driver.into(),
        }
    }

    /// Bound functions are symlinks named after their PCI address, the driver
    /// directory also holds control files such as `bind` and `new_id`.
    fn bound_functions(&self, root: &Path) -> Result<Vec<String>, Report<DiscoveryError>> {
        let scan_root = || DiscoveryError::ScanRoot {
            path: root.to_path_buf(),
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(root).change_context_lazy(scan_root)? {
            let entry = entry.change_context_lazy(scan_root)?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_symlink = entry.file_type().is_ok_and(|t| t.is_symlink());
            if is_symlink && sysfs::is_valid_pci_address(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn probe(&self, root: &Path, pci_address: &str) -> Result<DeviceRecord, Report<DiscoveryError>> {
        let device_dir = root.join(pci_address);
        let physfn = device_dir.join("physfn");

        let pf_name = sysfs::sorted_entries(&physfn.join("net"))
            .ok()
            .and_then(|names| names.into_iter().next())
            .map(|name| name.trim_end_matches(':').to_string())
            .ok_or_else(|| {
                Report::new(DiscoveryError::NoPhysicalFunction {
                    pci_address: pci_address.to_string(),
                })
            })?;

        let vf_index = vf_index(&physfn, pci_address);
        sysfs::probe_function(&self.layout, &device_dir, pci_address, pf_name, vf_index)
    }
}

/// The index is the `N` of the `virtfnN` link on the physical function that
/// points back at this address, or the function number of the address when the
/// physical function does not list it.
fn vf_index(physfn: &Path, pci_address: &str) -> u32 {
    let from_virtfn = sysfs::sorted_entries(physfn)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|name| {
            let index = name.strip_prefix("virtfn")?.parse::<u32>().ok()?;
            let target = sysfs::link_basename(&physfn.join(&name))?;
            (target == pci_address).then_some(index)
        })
        .next();

    from_virtfn.unwrap_or_else(|| {
        debug!("{pci_address} is not listed by its physical function, using function number");
        pci_address
            .rsplit(['.', ':'])
            .next()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0)
    })
}

impl DeviceDiscovery for DriverDirectoryScan {
    fn name(&self) -> &'static str {
        "driver"
    }

    fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
        let root = self.layout.driver_dir(&self.driver);
        info!("Scanning {} for passthrough functions", root.display());

        let mut devices = Vec::new();
        for pci_address in self.bound_functions(&root)? {
            match self.probe(&root, &pci_address) {
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
                Err(report) => warn!("Skipping {pci_address}: {report:?}"),
            }
        }

        Ok(devices)
    }
}
