//! Target device identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, BuildResult};

/// The form factor of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A desktop or laptop.
    #[default]
    Computer,
    /// An emulator or virtual machine.
    Emulator,
    /// A phone.
    Phone,
    /// A tablet.
    Tablet,
    /// An embedded board.
    MicroController,
}

/// What the pipeline needs to know about the device it builds for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Form factor.
    pub kind: DeviceKind,
    /// Kernel name, such as `linux`.
    pub kernel: String,
    /// CPU architecture, such as `x86_64`.
    pub arch: String,
    /// System or ABI, such as `gnu`.
    pub system: String,
}

impl DeviceInfo {
    /// Creates device info.
    #[must_use]
    pub fn new(
        kind: DeviceKind,
        arch: impl Into<String>,
        kernel: impl Into<String>,
        system: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            kernel: kernel.into(),
            arch: arch.into(),
            system: system.into(),
        }
    }

    /// Info describing the machine this process runs on.
    #[must_use]
    pub fn host() -> Self {
        let system = if cfg!(target_env = "musl") {
            "musl"
        } else if cfg!(target_env = "msvc") {
            "msvc"
        } else {
            "gnu"
        };
        Self::new(
            DeviceKind::Computer,
            std::env::consts::ARCH,
            std::env::consts::OS,
            system,
        )
    }

    /// The `arch-kernel-system` triplet.
    #[must_use]
    pub fn triplet(&self) -> String {
        format!("{}-{}-{}", self.arch, self.kernel, self.system)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triplet())
    }
}

/// A device the pipeline can build for and deploy to.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Stable identifier.
    fn id(&self) -> &str;

    /// Queries the device for its identity.
    async fn get_info(&self, cancel: &CancellationToken) -> BuildResult<DeviceInfo>;
}

/// The machine running the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LocalDevice;

#[async_trait]
impl Device for LocalDevice {
    fn id(&self) -> &str {
        "local"
    }

    async fn get_info(&self, cancel: &CancellationToken) -> BuildResult<DeviceInfo> {
        if cancel.is_cancelled() {
            return Err(BuildError::cancelled(
                cancel.reason().unwrap_or_else(|| "device query".to_string()),
            ));
        }
        Ok(DeviceInfo::host())
    }
}
