//! Helpers for reading PCI topology out of sysfs.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use once_cell::sync::Lazy;
use regex::Regex;

use super::types::DeviceRecord;
use super::types::DiscoveryError;

/// PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Where sysfs and device nodes live, `/sys` and `/dev` on a real host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsLayout {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsLayout {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl SysfsLayout {
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(sys_root: P1, dev_root: P2) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.sys_root.join("bus/pci/drivers").join(driver)
    }

    pub fn class_net_dir(&self) -> PathBuf {
        self.sys_root.join("class/net")
    }

    /// VFIO character device for an IOMMU group.
    pub fn group_node(&self, iommu_group: &str) -> PathBuf {
        self.dev_root.join("vfio").join(iommu_group)
    }
}

/// Basename of a symlink target, e.g. `../../0000:01:00.1` -> `0000:01:00.1`.
pub(crate) fn link_basename(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

/// Sorted entry names of a directory.
pub(crate) fn sorted_entries(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

/// Read a hex id attribute such as `vendor`, keeping it as text without `0x`.
fn read_hex_attribute(
    device_dir: &Path,
    attribute: &'static str,
    pci_address: &str,
) -> Result<String, Report<DiscoveryError>> {
    let path = device_dir.join(attribute);
    let content = fs::read_to_string(&path)
        .change_context_lazy(|| DiscoveryError::Attribute {
            pci_address: pci_address.to_string(),
            attribute,
        })
        .attach_printable_lazy(|| format!("path: {}", path.display()))?;

    let value = content.trim();
    Ok(value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .to_string())
}

/// Resolve the numeric IOMMU group from the `iommu_group` symlink.
fn read_iommu_group(device_dir: &Path, pci_address: &str) -> Result<String, Report<DiscoveryError>> {
    let group = link_basename(&device_dir.join("iommu_group"))
        .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));

    group.ok_or_else(|| {
        Report::new(DiscoveryError::IommuGroup {
            pci_address: pci_address.to_string(),
        })
    })
}

/// Read the attributes shared by both walks and gate on the group device node.
pub(crate) fn probe_function(
    layout: &SysfsLayout,
    device_dir: &Path,
    pci_address: &str,
    pf_name: String,
    vf_index: u32,
) -> Result<DeviceRecord, Report<DiscoveryError>> {
    let vendor_id = read_hex_attribute(device_dir, "vendor", pci_address)?;
    let device_id = read_hex_attribute(device_dir, "device", pci_address)?;
    let iommu_group = read_iommu_group(device_dir, pci_address)?;

    let node = layout.group_node(&iommu_group);
    if !node.exists() {
        return Err(Report::new(DiscoveryError::MissingGroupNode { path: node })
            .attach_printable(format!("device: {pci_address}")));
    }

    Ok(DeviceRecord {
        pci_address: pci_address.to_string(),
        vendor_id,
        device_id,
        iommu_group,
        pf_name,
        vf_index,
    })
}
