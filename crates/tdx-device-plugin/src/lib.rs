//! Kubernetes device plugin advertising the Intel TDX guest device.
//!
//! The plugin detects the guest device, advertises a fixed pool of
//! identical units to kubelet over the device plugin gRPC API, and exits as
//! soon as kubelet restarts or its own socket disappears, leaving the
//! restart to whatever supervises the process.

pub mod app;
pub mod config;
pub mod detector;
pub mod device_plugin;
pub mod errors;
pub mod inventory;
pub mod liveness;
pub mod registration;
pub mod server;
pub mod uds;

pub use device_plugin::api;
pub use errors::PluginError;
