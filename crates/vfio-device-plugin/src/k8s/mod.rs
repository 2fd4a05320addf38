//! Kubernetes Device Plugin integration.
//!
//! - [`VfioDevicePlugin`]: one gRPC server per device, started, registered
//!   with the kubelet and stopped by the controller
//! - [`naming`]: resource names, socket paths and environment keys

pub mod device_plugin;
pub mod naming;

pub use device_plugin::connect_uds;
pub use device_plugin::DevicePluginService;
pub use device_plugin::PluginState;
pub use device_plugin::VfioDevicePlugin;
