//! Worker bootstrap configuration.
//!
//! An external scheduler launches one process per rank and communicates the
//! job topology through environment variables. [`WorkerBootstrapConfig`]
//! reads that ambient state exactly once at process entry; afterwards the
//! struct is passed by reference and the environment is never consulted
//! again. [`WorkerBootstrapConfig::export_env`] mirrors the values back so
//! nested libraries that read the same variables see a consistent view.

use serde::{Deserialize, Serialize};

use super::register_center::RendezvousError;

/// Required: total number of ranks in the job.
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
/// Required: this process's rank, `0..world_size`.
pub const ENV_RANK: &str = "RANK";
/// Optional, default 1: ranks on this node.
pub const ENV_LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";
/// Optional, default 0: rank within this node.
pub const ENV_LOCAL_RANK: &str = "LOCAL_RANK";
/// Master endpoint address; rank 0 publishes it, other ranks require it.
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
/// Master endpoint port; rank 0 publishes it, other ranks require it.
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";
/// Optional accelerator visibility string.
pub const ENV_CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
/// Optional stable node identifier supplied by the launcher.
pub const ENV_NODE_ID: &str = "NODE_ID";
/// Set to a non-zero integer to skip rendezvous entirely.
pub const ENV_DISABLE_WORKER_INIT: &str = "DISABLE_WORKER_INIT";
/// Derived for downstream consumers: master address with brackets stripped.
pub const ENV_REDIS_STORE_SERVER_HOST: &str = "REDIS_STORE_SERVER_HOST";

/// ROCm runtime visibility list, set instead of `CUDA_VISIBLE_DEVICES` by
/// affected launcher versions.
pub const ENV_ROCR_VISIBLE_DEVICES: &str = "ROCR_VISIBLE_DEVICES";
/// Launcher-assigned local rank on the ROCm path.
pub const ENV_RAY_LOCAL_RANK: &str = "RAY_LOCAL_RANK";
/// Launcher version string, `major.minor[.patch]`.
pub const ENV_LAUNCHER_VERSION: &str = "LAUNCHER_VERSION";

/// Launcher versions at or above this set CUDA visibility correctly on ROCm.
const ROCM_SHIM_FIXED_IN: (u32, u32) = (2, 45);

/// Errors raised while bootstrapping a worker.
#[derive(Debug)]
pub enum BootstrapError {
    /// A required environment variable is absent. Fatal at startup.
    MissingEnv(&'static str),
    /// A variable was present but failed to parse.
    InvalidEnv { key: &'static str, value: String },
    /// Socket-level failure while resolving the master endpoint.
    Network(std::io::Error),
    /// Rendezvous-store failure during bootstrap.
    Rendezvous(RendezvousError),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapError::MissingEnv(key) => {
                write!(f, "required environment variable {} is not set", key)
            }
            BootstrapError::InvalidEnv { key, value } => {
                write!(f, "environment variable {}={:?} failed to parse", key, value)
            }
            BootstrapError::Network(e) => write!(f, "network resolution failed: {}", e),
            BootstrapError::Rendezvous(e) => write!(f, "rendezvous failed: {}", e),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<RendezvousError> for BootstrapError {
    fn from(e: RendezvousError) -> Self {
        BootstrapError::Rendezvous(e)
    }
}

/// Immutable per-process identity, read from the environment once at entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBootstrapConfig {
    /// Total ranks in the job.
    pub world_size: usize,
    /// This process's rank.
    pub rank: usize,
    /// Ranks on this node.
    pub local_world_size: usize,
    /// Rank within this node.
    pub local_rank: usize,
    /// Master address; empty on rank 0 until rendezvous publishes it.
    pub master_addr: Option<String>,
    /// Master port; `None` on rank 0 until rendezvous publishes it.
    pub master_port: Option<u16>,
    /// Accelerator visibility string, if assigned.
    pub cuda_visible_devices: Option<String>,
    /// Stable node identifier for affinity scheduling.
    pub node_id: String,
    /// Rendezvous disabled via `DISABLE_WORKER_INIT`.
    pub worker_init_disabled: bool,
}

impl WorkerBootstrapConfig {
    /// Read the bootstrap environment.
    ///
    /// `WORLD_SIZE` and `RANK` are required; the local pair defaults to a
    /// single-rank node. The master endpoint is optional here because rank 0
    /// resolves its own; [`crate::rendezvous::Worker::bootstrap`] enforces
    /// that ranks > 0 obtain one. The ROCm visibility shim is applied before
    /// the values are frozen.
    pub fn from_env() -> Result<Self, BootstrapError> {
        let world_size = require_parsed(ENV_WORLD_SIZE)?;
        let rank = require_parsed(ENV_RANK)?;
        let local_world_size = optional_parsed(ENV_LOCAL_WORLD_SIZE)?.unwrap_or(1);
        let mut local_rank = optional_parsed(ENV_LOCAL_RANK)?.unwrap_or(0);

        let master_addr = std::env::var(ENV_MASTER_ADDR).ok().filter(|v| !v.is_empty());
        let master_port = match std::env::var(ENV_MASTER_PORT) {
            Ok(raw) if !raw.is_empty() => {
                Some(raw.parse::<u16>().map_err(|_| BootstrapError::InvalidEnv {
                    key: ENV_MASTER_PORT,
                    value: raw,
                })?)
            }
            _ => None,
        };

        let mut cuda_visible_devices = std::env::var(ENV_CUDA_VISIBLE_DEVICES).ok();

        if rocm_shim_applies() {
            // Older launchers leave CUDA_VISIBLE_DEVICES/LOCAL_RANK unset on
            // ROCm nodes; re-derive both from the vendor variables.
            if let Ok(devices) = std::env::var(ENV_ROCR_VISIBLE_DEVICES) {
                cuda_visible_devices = Some(devices);
            }
            if let Some(ray_local_rank) = optional_parsed(ENV_RAY_LOCAL_RANK)? {
                local_rank = ray_local_rank;
            }
        }

        let node_id = std::env::var(ENV_NODE_ID)
            .unwrap_or_else(|_| format!("pid-{}", std::process::id()));

        let worker_init_disabled = std::env::var(ENV_DISABLE_WORKER_INIT)
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v != 0)
            .unwrap_or(false);

        Ok(Self {
            world_size,
            rank,
            local_world_size,
            local_rank,
            master_addr,
            master_port,
            cuda_visible_devices,
            node_id,
            worker_init_disabled,
        })
    }

    /// Record the master endpoint (rank 0 after resolving, ranks > 0 after
    /// reading it back from the register center).
    pub fn set_master(&mut self, addr: String, port: u16) {
        self.master_addr = Some(addr);
        self.master_port = Some(port);
    }

    /// Master address with IPv6 brackets stripped, suitable as a
    /// coordination-store host.
    pub fn store_host(&self) -> Option<String> {
        self.master_addr
            .as_ref()
            .map(|addr| addr.replace(['[', ']'], ""))
    }

    /// Mirror the identity set back into the process environment.
    ///
    /// Nested libraries (device runtimes, collective-communication backends)
    /// read the same variables; exporting keeps their view consistent with
    /// this struct.
    pub fn export_env(&self) {
        std::env::set_var(ENV_WORLD_SIZE, self.world_size.to_string());
        std::env::set_var(ENV_RANK, self.rank.to_string());
        std::env::set_var(ENV_LOCAL_WORLD_SIZE, self.local_world_size.to_string());
        std::env::set_var(ENV_LOCAL_RANK, self.local_rank.to_string());
        if let Some(addr) = &self.master_addr {
            std::env::set_var(ENV_MASTER_ADDR, addr);
        }
        if let Some(port) = self.master_port {
            std::env::set_var(ENV_MASTER_PORT, port.to_string());
        }
        if let Some(devices) = &self.cuda_visible_devices {
            std::env::set_var(ENV_CUDA_VISIBLE_DEVICES, devices);
        }
        std::env::set_var(
            ENV_REDIS_STORE_SERVER_HOST,
            self.store_host().unwrap_or_default(),
        );
    }
}

/// True when the ROCm device-visibility workaround must run: the vendor
/// visibility list is present and the launcher predates the fix.
fn rocm_shim_applies() -> bool {
    if std::env::var(ENV_ROCR_VISIBLE_DEVICES).is_err() {
        return false;
    }
    match std::env::var(ENV_LAUNCHER_VERSION) {
        Ok(raw) => match parse_version(&raw) {
            Some(version) => version < ROCM_SHIM_FIXED_IN,
            None => false,
        },
        Err(_) => false,
    }
}

/// Parse `major.minor[.anything]` into a comparable pair.
fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

fn require_parsed(key: &'static str) -> Result<usize, BootstrapError> {
    let raw = std::env::var(key).map_err(|_| BootstrapError::MissingEnv(key))?;
    raw.parse()
        .map_err(|_| BootstrapError::InvalidEnv { key, value: raw })
}

fn optional_parsed(key: &'static str) -> Result<Option<usize>, BootstrapError> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| BootstrapError::InvalidEnv { key, value: raw }),
        _ => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::{Mutex, MutexGuard};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Tests mutating the process environment must hold this.
    pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
        ENV_MUTEX.lock()
    }

    pub(crate) fn clear_bootstrap_env() {
        for key in [
            ENV_WORLD_SIZE,
            ENV_RANK,
            ENV_LOCAL_WORLD_SIZE,
            ENV_LOCAL_RANK,
            ENV_MASTER_ADDR,
            ENV_MASTER_PORT,
            ENV_CUDA_VISIBLE_DEVICES,
            ENV_NODE_ID,
            ENV_DISABLE_WORKER_INIT,
            ENV_REDIS_STORE_SERVER_HOST,
            ENV_ROCR_VISIBLE_DEVICES,
            ENV_RAY_LOCAL_RANK,
            ENV_LAUNCHER_VERSION,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_WORLD_SIZE, "8");
        std::env::set_var(ENV_RANK, "3");
        std::env::set_var(ENV_MASTER_ADDR, "10.0.0.1");
        std::env::set_var(ENV_MASTER_PORT, "29500");

        let config = WorkerBootstrapConfig::from_env().unwrap();
        clear_bootstrap_env();

        assert_eq!(config.world_size, 8);
        assert_eq!(config.rank, 3);
        assert_eq!(config.local_world_size, 1);
        assert_eq!(config.local_rank, 0);
        assert_eq!(config.master_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.master_port, Some(29500));
        assert!(!config.worker_init_disabled);
    }

    #[test]
    fn test_missing_world_size_is_fatal() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_RANK, "0");

        let err = WorkerBootstrapConfig::from_env().unwrap_err();
        clear_bootstrap_env();

        match err {
            BootstrapError::MissingEnv(key) => assert_eq!(key, ENV_WORLD_SIZE),
            other => panic!("expected MissingEnv, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_rank_is_fatal() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_WORLD_SIZE, "4");
        std::env::set_var(ENV_RANK, "not-a-rank");

        let err = WorkerBootstrapConfig::from_env().unwrap_err();
        clear_bootstrap_env();

        match err {
            BootstrapError::InvalidEnv { key, value } => {
                assert_eq!(key, ENV_RANK);
                assert_eq!(value, "not-a-rank");
            }
            other => panic!("expected InvalidEnv, got {:?}", other),
        }
    }

    #[test]
    fn test_store_host_strips_ipv6_brackets() {
        let config = WorkerBootstrapConfig {
            world_size: 2,
            rank: 1,
            local_world_size: 1,
            local_rank: 0,
            master_addr: Some("[fd00::1]".to_string()),
            master_port: Some(29500),
            cuda_visible_devices: None,
            node_id: "node-1".to_string(),
            worker_init_disabled: false,
        };

        assert_eq!(config.store_host().as_deref(), Some("fd00::1"));
    }

    #[test]
    fn test_export_env_mirrors_identity() {
        let _guard = env_lock();
        clear_bootstrap_env();

        let config = WorkerBootstrapConfig {
            world_size: 4,
            rank: 2,
            local_world_size: 2,
            local_rank: 1,
            master_addr: Some("[fd00::1]".to_string()),
            master_port: Some(29501),
            cuda_visible_devices: Some("0,1".to_string()),
            node_id: "node-a".to_string(),
            worker_init_disabled: false,
        };
        config.export_env();

        assert_eq!(std::env::var(ENV_WORLD_SIZE).unwrap(), "4");
        assert_eq!(std::env::var(ENV_RANK).unwrap(), "2");
        assert_eq!(std::env::var(ENV_LOCAL_WORLD_SIZE).unwrap(), "2");
        assert_eq!(std::env::var(ENV_LOCAL_RANK).unwrap(), "1");
        assert_eq!(std::env::var(ENV_MASTER_ADDR).unwrap(), "[fd00::1]");
        assert_eq!(std::env::var(ENV_MASTER_PORT).unwrap(), "29501");
        assert_eq!(std::env::var(ENV_CUDA_VISIBLE_DEVICES).unwrap(), "0,1");
        assert_eq!(std::env::var(ENV_REDIS_STORE_SERVER_HOST).unwrap(), "fd00::1");
        clear_bootstrap_env();
    }

    #[test]
    fn test_rocm_shim_rederives_visibility() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_WORLD_SIZE, "2");
        std::env::set_var(ENV_RANK, "0");
        std::env::set_var(ENV_LOCAL_RANK, "0");
        std::env::set_var(ENV_ROCR_VISIBLE_DEVICES, "4,5");
        std::env::set_var(ENV_RAY_LOCAL_RANK, "1");
        std::env::set_var(ENV_LAUNCHER_VERSION, "2.40.0");

        let config = WorkerBootstrapConfig::from_env().unwrap();
        clear_bootstrap_env();

        assert_eq!(config.cuda_visible_devices.as_deref(), Some("4,5"));
        assert_eq!(config.local_rank, 1);
    }

    #[test]
    fn test_rocm_shim_skipped_on_fixed_launcher() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_WORLD_SIZE, "2");
        std::env::set_var(ENV_RANK, "0");
        std::env::set_var(ENV_LOCAL_RANK, "0");
        std::env::set_var(ENV_CUDA_VISIBLE_DEVICES, "0");
        std::env::set_var(ENV_ROCR_VISIBLE_DEVICES, "4,5");
        std::env::set_var(ENV_RAY_LOCAL_RANK, "1");
        std::env::set_var(ENV_LAUNCHER_VERSION, "2.45.0");

        let config = WorkerBootstrapConfig::from_env().unwrap();
        clear_bootstrap_env();

        assert_eq!(config.cuda_visible_devices.as_deref(), Some("0"));
        assert_eq!(config.local_rank, 0);
    }

    #[test]
    fn test_disable_worker_init_flag() {
        let _guard = env_lock();
        clear_bootstrap_env();
        std::env::set_var(ENV_WORLD_SIZE, "1");
        std::env::set_var(ENV_RANK, "0");
        std::env::set_var(ENV_DISABLE_WORKER_INIT, "1");

        let config = WorkerBootstrapConfig::from_env().unwrap();
        clear_bootstrap_env();

        assert!(config.worker_init_disabled);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.45.0"), Some((2, 45)));
        assert_eq!(parse_version("2.9"), Some((2, 9)));
        assert_eq!(parse_version("3"), Some((3, 0)));
        assert_eq!(parse_version("nightly"), None);
    }
}
