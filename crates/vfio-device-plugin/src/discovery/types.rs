use std::path::PathBuf;

use thiserror::Error;

/// A passthrough-capable virtual function found on the host.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{pci_address} [{vendor_id}:{device_id}] group {iommu_group}")]
pub struct DeviceRecord {
    /// PCI address in bus:device:function form, e.g. "0000:01:00.0"
    pub pci_address: String,
    /// Vendor id without the `0x` prefix, e.g. "8086"
    pub vendor_id: String,
    /// Device id without the `0x` prefix
    pub device_id: String,
    /// IOMMU group number, also the advertised device id
    pub iommu_group: String,
    /// Network interface name of the owning physical function
    pub pf_name: String,
    /// Virtual function index within the physical function
    pub vf_index: u32,
}

/// Errors that can occur while inspecting the platform topology.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to read scan root {path}")]
    ScanRoot { path: PathBuf },
    #[error("Failed to read attribute `{attribute}` of {pci_address}")]
    Attribute {
        pci_address: String,
        attribute: &'static str,
    },
    #[error("Failed to resolve IOMMU group of {pci_address}")]
    IommuGroup { pci_address: String },
    #[error("IOMMU group device node {path} is missing")]
    MissingGroupNode { path: PathBuf },
    #[error("No physical function network interface for {pci_address}")]
    NoPhysicalFunction { pci_address: String },
    #[error("{pci_address} is not bound to {driver}")]
    NotBound { pci_address: String, driver: String },
}
