//! Constants for the workspace control plane.
//!
//! All limits, timeouts, and label keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Runtime Labels
// =============================================================================

/// Namespace marker applied to every container we create. Listing by this
/// label alone recovers ownership across server restarts.
pub const LABEL_NAMESPACE: &str = "devbench";

/// Label carrying the opaque container id.
pub const LABEL_CONTAINER_ID: &str = "devbench.container_id";

/// Label carrying the container alias, when one was assigned.
pub const LABEL_ALIAS: &str = "devbench.alias";

/// Label marking warm-pool members.
pub const LABEL_WARM: &str = "devbench.warm";

// =============================================================================
// Volume Naming
// =============================================================================

/// Name prefix for workspace volumes backing persistent containers.
pub const PERSIST_VOLUME_PREFIX: &str = "devbench_persist_";

/// Name prefix for workspace volumes backing transient containers.
pub const TRANSIENT_VOLUME_PREFIX: &str = "devbench_transient_";

// =============================================================================
// Execution Limits
// =============================================================================

/// Default concurrent executions per container.
pub const DEFAULT_EXECS_PER_CONTAINER: usize = 4;

/// Default per-execution output buffer budget (64 MiB).
pub const DEFAULT_EXEC_OUTPUT_BUDGET: usize = 64 * 1024 * 1024;

/// Maximum bytes returned by a single poll response.
pub const POLL_RESPONSE_CAP_BYTES: usize = 2 * 1024 * 1024;

/// Default execution timeout when the request omits one.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace window between a graceful stop signal and force-termination,
/// used by both timeout and cancellation escalation.
pub const EXEC_KILL_GRACE: Duration = Duration::from_secs(5);

/// Retention window for terminal executions (rows and ring buffers).
pub const EXEC_RETENTION: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// Idempotency
// =============================================================================

/// How long an idempotency key deduplicates after first use.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// Lifecycle Timeouts
// =============================================================================

/// Graceful container stop window before the daemon force-kills.
pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default drain window for in-flight executions during shutdown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(60);

/// Default warm-pool health check interval.
pub const DEFAULT_WARM_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between periodic maintenance passes.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Back-off after a failed maintenance pass.
pub const MAINTENANCE_RETRY: Duration = Duration::from_secs(60);

// =============================================================================
// Workspace
// =============================================================================

/// Default mount path of the workspace volume inside containers.
pub const DEFAULT_WORKSPACE_MOUNT: &str = "/workspace";

/// Maximum size accepted for a single tar import batch (1 GiB).
pub const MAX_TAR_IMPORT_BYTES: u64 = 1024 * 1024 * 1024;

/// Hex characters of the content hash folded into an ETag.
pub const ETAG_HASH_PREFIX_LEN: usize = 16;

// =============================================================================
// Identifier Validation
// =============================================================================

/// Maximum image reference length. Prevents injection via oversized refs.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum alias length.
pub const MAX_ALIAS_LEN: usize = 100;

/// Valid characters for container aliases.
pub const ALIAS_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Validates an alias against length and character constraints.
pub fn validate_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias.chars().all(|c| ALIAS_VALID_CHARS.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_alias() {
        assert!(validate_alias("w1"));
        assert!(validate_alias("my-workspace_2"));
        assert!(!validate_alias(""));
        assert!(!validate_alias("has space"));
        assert!(!validate_alias("dot.dot"));
        assert!(!validate_alias(&"x".repeat(MAX_ALIAS_LEN + 1)));
    }
}
