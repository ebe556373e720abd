//! Hardened defaults for container creation and command execution.
//!
//! Containers run as an unprivileged user on a read-only root filesystem
//! with all capabilities dropped; only the workspace volume is writable.
//! The privileged flag is never set, by construction - there is no code
//! path that could enable it.

use crate::runtime::{NetworkMode, ResourceLimits};

/// Default unprivileged UID inside containers.
pub const DEFAULT_UID: u32 = 1000;

/// Default unprivileged GID inside containers.
pub const DEFAULT_GID: u32 = 1000;

/// Default memory ceiling (512 MiB).
pub const DEFAULT_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Default CPU quota: one full CPU (quota == period).
pub const DEFAULT_CPU_QUOTA_US: i64 = 100_000;

/// CPU accounting period.
pub const DEFAULT_CPU_PERIOD_US: i64 = 100_000;

/// Maximum processes per container.
pub const DEFAULT_PIDS_LIMIT: i64 = 256;

/// Security profile applied to new containers.
#[derive(Debug, Clone)]
pub struct SecurityDefaults {
    pub uid: u32,
    pub gid: u32,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
    pub allow_network: bool,
    pub limits: ResourceLimits,
}

impl Default for SecurityDefaults {
    fn default() -> Self {
        Self {
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            cap_drop: vec!["ALL".to_string()],
            no_new_privileges: true,
            read_only_rootfs: true,
            allow_network: true,
            limits: ResourceLimits {
                memory_bytes: DEFAULT_MEMORY_BYTES,
                cpu_quota_us: DEFAULT_CPU_QUOTA_US,
                cpu_period_us: DEFAULT_CPU_PERIOD_US,
                pids_limit: DEFAULT_PIDS_LIMIT,
            },
        }
    }
}

impl SecurityDefaults {
    /// `uid:gid` string for container creation.
    pub fn container_user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    /// User string for an exec: root when explicitly requested, the
    /// unprivileged UID otherwise. Root requests are audited by the caller.
    pub fn exec_user(&self, as_root: bool) -> String {
        if as_root {
            "0".to_string()
        } else {
            self.uid.to_string()
        }
    }

    /// Network policy for new containers.
    pub fn network_mode(&self) -> NetworkMode {
        if self.allow_network {
            NetworkMode::Bridge
        } else {
            NetworkMode::None
        }
    }
}
