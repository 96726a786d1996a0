//! Shared helpers for the TDX device plugin binaries.

mod build_info;
pub mod logging;
pub mod version;
