//! Kubelet device plugin advertising VFIO-bound PCI virtual functions.
//!
//! - [`discovery`]: builds the device inventory from sysfs
//! - [`k8s`]: the per-device Device Plugin gRPC server
//! - [`controller`]: owns the servers and restarts them on kubelet restarts
//!   and SIGHUP

pub mod config;
pub mod controller;
pub mod discovery;
pub mod k8s;
