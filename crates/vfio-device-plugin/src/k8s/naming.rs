//! Resource, socket and environment naming.

use std::path::Path;
use std::path::PathBuf;

/// Prefix of the environment variables carrying the PCI address.
pub const ENV_PREFIX: &str = "PCI_RESOURCE_";

/// `<namespace>/<pf>-vf<index>`, e.g. `kr-vf/eth0-vf0`.
pub fn resource_name(namespace: &str, pf_name: &str, vf_index: u32) -> String {
    format!("{namespace}/{pf_name}-vf{vf_index}")
}

/// Inverse of [`resource_name`], `None` when the name does not follow it.
pub fn parse_resource_name(name: &str) -> Option<(&str, &str, u32)> {
    let (namespace, rest) = name.split_once('/')?;
    let (pf_name, index) = rest.rsplit_once("-vf")?;
    if namespace.is_empty() || pf_name.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((namespace, pf_name, index.parse().ok()?))
}

/// Plugin socket for a resource, `/` replaced since it is a single file name.
pub fn socket_path(plugin_dir: &Path, resource_name: &str) -> PathBuf {
    plugin_dir.join(format!("{}.sock", resource_name.replace('/', "-")))
}

/// Environment key where every non-alphanumeric character becomes `_`.
pub fn env_key_strict(resource_name: &str) -> String {
    sanitize_env_name(&format!("{ENV_PREFIX}{resource_name}"), |_| false)
}

/// Environment key that also keeps `_` and `-`.
///
/// KubeVirt looks the variable up without replacing `-`.
pub fn env_key_lenient(resource_name: &str) -> String {
    sanitize_env_name(&format!("{ENV_PREFIX}{resource_name}"), |c| {
        c == '_' || c == '-'
    })
}

fn sanitize_env_name(name: &str, keep: impl Fn(char) -> bool) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || keep(c) {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Sysfs tree of the PCI domain and bus holding a device:
/// `0000:01:00.0` -> `/sys/devices/pci0000:01`.
pub fn pci_domain_path(pci_address: &str) -> String {
    let bus = pci_address
        .rsplit_once(':')
        .map_or(pci_address, |(bus, _)| bus);
    format!("/sys/devices/pci{bus}")
}
