//! Generated bindings for the kubelet Device Plugin `v1beta1` API.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// API version sent in registration requests.
pub const VERSION: &str = "v1beta1";

/// Directory holding the kubelet registration socket and plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// Well-known kubelet registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Health value reported for a usable device.
pub const HEALTHY: &str = "Healthy";
