//! Process-wide configuration.
//!
//! All recognized options are enumerated on [`Config`]; there is no
//! dynamic-keyword passthrough. Values load from `DEVBENCH_*` environment
//! variables, and malformed values are load errors rather than silent
//! defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_DRAIN_GRACE, DEFAULT_EXECS_PER_CONTAINER, DEFAULT_EXEC_OUTPUT_BUDGET,
    DEFAULT_EXEC_TIMEOUT, DEFAULT_WARM_HEALTH_INTERVAL, DEFAULT_WORKSPACE_MOUNT,
};
use crate::error::{Error, Result};

/// Environment variable prefix for all options.
const ENV_PREFIX: &str = "DEVBENCH_";

/// Process-wide configuration object, passed explicitly to every subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry hostnames images may be pulled from.
    pub allowed_registries: Vec<String>,
    /// Optional explicit allow-list of image references. Empty = any image
    /// from an allowed registry.
    pub allowed_images: Vec<String>,
    /// Filesystem path of the durable state database.
    pub state_db_path: PathBuf,
    /// Optional daemon URI override (unix socket or tcp). `None` uses the
    /// daemon's standard local detection.
    pub docker_host: Option<String>,
    /// Drain window for in-flight executions during shutdown.
    pub drain_grace: Duration,
    /// Age threshold for orphan-transient removal.
    pub transient_gc_days: u32,
    /// Per-container concurrent execution limit.
    pub concurrent_execs_per_container: usize,
    /// Per-execution ring-buffer byte budget.
    pub exec_output_budget_bytes: usize,
    /// Default execution timeout when a request omits one.
    pub default_exec_timeout: Duration,
    /// Whether the warm pool runs.
    pub warm_pool_enabled: bool,
    /// Number of pre-created warm containers to maintain.
    pub warm_pool_size: usize,
    /// Image used for warm-pool members.
    pub default_image: String,
    /// Warm-pool health check interval.
    pub warm_health_check_interval: Duration,
    /// Mount path of the workspace volume inside containers.
    pub workspace_mount_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_registries: vec!["docker.io".to_string(), "ghcr.io".to_string()],
            allowed_images: Vec::new(),
            state_db_path: PathBuf::from("./devbench.db"),
            docker_host: None,
            drain_grace: DEFAULT_DRAIN_GRACE,
            transient_gc_days: 7,
            concurrent_execs_per_container: DEFAULT_EXECS_PER_CONTAINER,
            exec_output_budget_bytes: DEFAULT_EXEC_OUTPUT_BUDGET,
            default_exec_timeout: DEFAULT_EXEC_TIMEOUT,
            warm_pool_enabled: true,
            warm_pool_size: 1,
            default_image: "python:3.11-slim".to_string(),
            warm_health_check_interval: DEFAULT_WARM_HEALTH_INTERVAL,
            workspace_mount_path: DEFAULT_WORKSPACE_MOUNT.to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from `DEVBENCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::from_vars(&vars)
    }

    /// Loads configuration from an explicit variable map. Exposed for tests.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();

        for (key, value) in vars {
            let option = key
                .strip_prefix(ENV_PREFIX)
                .unwrap_or(key.as_str())
                .to_ascii_lowercase();
            match option.as_str() {
                "allowed_registries" => {
                    cfg.allowed_registries = split_list(value);
                }
                "allowed_images" => {
                    cfg.allowed_images = split_list(value);
                }
                "state_db_path" => {
                    cfg.state_db_path = PathBuf::from(value);
                }
                "docker_host" => {
                    cfg.docker_host = Some(value.clone());
                }
                "drain_grace_seconds" => {
                    cfg.drain_grace = Duration::from_secs(parse(&option, value)?);
                }
                "transient_gc_days" => {
                    cfg.transient_gc_days = parse(&option, value)?;
                }
                "concurrent_execs_per_container" => {
                    cfg.concurrent_execs_per_container = parse_nonzero(&option, value)?;
                }
                "exec_output_budget_bytes" => {
                    cfg.exec_output_budget_bytes = parse_nonzero(&option, value)?;
                }
                "default_exec_timeout_seconds" => {
                    cfg.default_exec_timeout = Duration::from_secs(parse(&option, value)?);
                }
                "warm_pool_enabled" => {
                    cfg.warm_pool_enabled = parse_bool(&option, value)?;
                }
                "warm_pool_size" => {
                    cfg.warm_pool_size = parse(&option, value)?;
                }
                "default_image" => {
                    cfg.default_image = value.clone();
                }
                "warm_health_check_interval_seconds" => {
                    cfg.warm_health_check_interval = Duration::from_secs(parse(&option, value)?);
                }
                "workspace_mount_path" => {
                    cfg.workspace_mount_path = value.clone();
                }
                unknown => {
                    return Err(Error::Config {
                        option: unknown.to_string(),
                        reason: "unrecognized option".to_string(),
                    });
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.allowed_registries.is_empty() {
            return Err(Error::Config {
                option: "allowed_registries".to_string(),
                reason: "must list at least one registry".to_string(),
            });
        }
        if !self.workspace_mount_path.starts_with('/') {
            return Err(Error::Config {
                option: "workspace_mount_path".to_string(),
                reason: "must be an absolute path".to_string(),
            });
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse<T: std::str::FromStr>(option: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::Config {
        option: option.to_string(),
        reason: format!("cannot parse '{value}'"),
    })
}

fn parse_nonzero(option: &str, value: &str) -> Result<usize> {
    let n: usize = parse(option, value)?;
    if n == 0 {
        return Err(Error::Config {
            option: option.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config {
            option: option.to_string(),
            reason: format!("cannot parse '{value}' as bool"),
        }),
    }
}
