//! TDX guest device detection.
//!
//! Three device interfaces have shipped over time. The deprecated
//! attestation device must not coexist with the plugin, so its presence
//! blocks startup even when a usable guest device is also present.

use std::path::Path;
use std::path::PathBuf;

use derive_more::Display;
use error_stack::Report;
use tracing::info;

use crate::errors::PluginError;

/// Host paths of the TDX guest device interfaces, in probing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdxDevicePaths {
    pub deprecated: PathBuf,
    pub v1_0: PathBuf,
    pub v1_5: PathBuf,
}

impl Default for TdxDevicePaths {
    fn default() -> Self {
        Self {
            deprecated: PathBuf::from("/dev/tdx-attest"),
            v1_0: PathBuf::from("/dev/tdx-guest"),
            v1_5: PathBuf::from("/dev/tdx_guest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TdxVersion {
    #[display("1.0")]
    V1_0,
    #[display("1.5")]
    V1_5,
}

/// A successfully detected guest device interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    pub version: TdxVersion,
    pub path: PathBuf,
}

/// Answers whether a device node exists on the host.
pub trait DeviceProbe {
    fn exists(&self, path: &Path) -> bool;
}

/// Probes the real host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDeviceProbe;

impl DeviceProbe for HostDeviceProbe {
    fn exists(&self, path: &Path) -> bool {
        std::fs::metadata(path).is_ok()
    }
}

/// Find the TDX guest device interface.
///
/// # Errors
///
/// - [`PluginError::DeprecatedCapability`] if the deprecated device exists,
///   regardless of the other two.
/// - [`PluginError::CapabilityNotFound`] if neither guest device exists.
pub fn detect(
    paths: &TdxDevicePaths,
    probe: &impl DeviceProbe,
) -> Result<DetectedDevice, Report<PluginError>> {
    if probe.exists(&paths.deprecated) {
        return Err(Report::new(PluginError::DeprecatedCapability {
            path: paths.deprecated.clone(),
        }));
    }

    let candidates = [
        (TdxVersion::V1_0, &paths.v1_0),
        (TdxVersion::V1_5, &paths.v1_5),
    ];
    for (version, path) in candidates {
        if probe.exists(path) {
            info!(%version, path = %path.display(), "found TDX guest device");
            return Ok(DetectedDevice {
                version,
                path: path.clone(),
            });
        }
    }

    Err(Report::new(PluginError::CapabilityNotFound)
        .attach_printable(format!("probed {}", paths.v1_0.display()))
        .attach_printable(format!("probed {}", paths.v1_5.display())))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use similar_asserts::assert_eq;

    use super::*;

    /// Probe answering from a fixed set of present paths.
    pub(crate) struct FakeProbe(pub HashSet<PathBuf>);

    impl FakeProbe {
        pub(crate) fn with(paths: &[&Path]) -> Self {
            Self(paths.iter().map(|p| p.to_path_buf()).collect())
        }
    }

    impl DeviceProbe for FakeProbe {
        fn exists(&self, path: &Path) -> bool {
            self.0.contains(path)
        }
    }

    #[test]
    fn deprecated_device_wins_over_guest_devices() {
        let paths = TdxDevicePaths::default();
        let probe = FakeProbe::with(&[
            paths.deprecated.as_path(),
            paths.v1_0.as_path(),
            paths.v1_5.as_path(),
        ]);

        let err = detect(&paths, &probe).expect_err("deprecated device must block startup");
        assert!(matches!(
            err.current_context(),
            PluginError::DeprecatedCapability { .. }
        ));
    }

    #[test]
    fn v1_0_is_preferred_over_v1_5() {
        let paths = TdxDevicePaths::default();
        let probe = FakeProbe::with(&[paths.v1_0.as_path(), paths.v1_5.as_path()]);

        let detected = detect(&paths, &probe).expect("should detect");
        assert_eq!(detected.version, TdxVersion::V1_0);
        assert_eq!(detected.path, paths.v1_0);
    }

    #[test]
    fn v1_5_is_selected_when_alone() {
        let paths = TdxDevicePaths::default();
        let probe = FakeProbe::with(&[paths.v1_5.as_path()]);

        let detected = detect(&paths, &probe).expect("should detect");
        assert_eq!(detected.version, TdxVersion::V1_5);
        assert_eq!(detected.version.to_string(), "1.5");
    }

    #[test]
    fn nothing_present_is_not_found() {
        let paths = TdxDevicePaths::default();
        let probe = FakeProbe::with(&[]);

        let err = detect(&paths, &probe).expect_err("nothing to detect");
        assert!(matches!(
            err.current_context(),
            PluginError::CapabilityNotFound
        ));
    }

    #[test]
    fn host_probe_sees_real_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = TdxDevicePaths {
            deprecated: dir.path().join("tdx-attest"),
            v1_0: dir.path().join("tdx-guest"),
            v1_5: dir.path().join("tdx_guest"),
        };
        std::fs::write(&paths.v1_5, b"").expect("create device stand-in");

        let detected = detect(&paths, &HostDeviceProbe).expect("should detect");
        assert_eq!(detected.version, TdxVersion::V1_5);

        std::fs::write(&paths.deprecated, b"").expect("create deprecated stand-in");
        assert!(detect(&paths, &HostDeviceProbe).is_err());
    }
}
