use std::path::PathBuf;

use clap::Parser;
use utils::version;

/// Default location of the plugin settings file.
pub const DEFAULT_CONFIG_PATH: &str = "/root/config/config.yml";

/// VFIO device plugin for Kubernetes
///
/// Advertises IOMMU-isolated PCI virtual functions bound to a passthrough
/// driver as kubelet device plugin resources.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "VFIO_DP_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the configuration file"
    )]
    pub config: PathBuf,
}
