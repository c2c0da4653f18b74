//! Per-process worker identity.

use serde::{Deserialize, Serialize};

use super::bootstrap::{BootstrapError, WorkerBootstrapConfig};
use super::network::resolve_network_address;
use super::register_center::{MasterInfo, RegisterCenterHandle, RegistryStore};

/// A worker's position along the four parallelism axes
/// (tensor, data, pipeline, context/sequence).
///
/// Assigned once by the sharding backend and used for diagnostics and
/// placement only; the rendezvous logic never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub tp_rank: usize,
    pub dp_rank: usize,
    pub pp_rank: usize,
    pub cp_rank: usize,
}

/// Group sizes along the same four axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalInfo {
    pub tp_size: usize,
    pub dp_size: usize,
    pub pp_size: usize,
    pub cp_size: usize,
}

impl GlobalInfo {
    /// True when `rank` is in range on every axis. Bootstrap does not call
    /// this; it exists so sharding backends can validate their assignments.
    pub fn contains(&self, rank: &RankInfo) -> bool {
        rank.tp_rank < self.tp_size
            && rank.dp_rank < self.dp_size
            && rank.pp_rank < self.pp_size
            && rank.cp_rank < self.cp_size
    }
}

/// A bootstrapped distributed worker.
///
/// Constructed once per process. Rank 0 resolves its own network address,
/// publishes it through the register center, and mirrors it into the
/// environment; every other rank reads the same endpoint back. All ranks
/// register their node placement unconditionally.
#[derive(Debug)]
pub struct Worker {
    config: WorkerBootstrapConfig,
    register_center: Option<RegisterCenterHandle>,
}

impl Worker {
    /// Join (or, on rank 0, create) the register center named
    /// `coordinator_name` and freeze this process's identity.
    ///
    /// Launch ordering is the caller's responsibility: a rank > 0 that
    /// bootstraps before rank 0 has created the center fails with
    /// [`super::RendezvousError::NotFound`]; there is no wait or retry.
    ///
    /// With `worker_init_disabled` (the `DISABLE_WORKER_INIT` escape hatch
    /// for externally managed process groups) the whole exchange is skipped:
    /// no resolution, no registration, no environment mirroring.
    pub fn bootstrap<R: RegistryStore>(
        mut config: WorkerBootstrapConfig,
        registry: &R,
        coordinator_name: &str,
    ) -> Result<Self, BootstrapError> {
        if config.worker_init_disabled {
            return Ok(Self {
                config,
                register_center: None,
            });
        }

        let register_center = if config.rank == 0 {
            let (addr, port) = resolve_network_address()?;
            config.set_master(addr.clone(), port);
            registry.create(coordinator_name, MasterInfo { addr, port })?
        } else {
            let center = registry.lookup(coordinator_name)?;
            let master = center.master_info().clone();
            config.set_master(master.addr, master.port);
            center
        };

        // Node placement is published for every rank, master or not.
        register_center.set_worker_info(config.rank, &config.node_id);

        config.export_env();

        Ok(Self {
            config,
            register_center: Some(register_center),
        })
    }

    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.config.rank
    }

    /// Total ranks in the job.
    pub fn world_size(&self) -> usize {
        self.config.world_size
    }

    /// Rank within this node.
    pub fn local_rank(&self) -> usize {
        self.config.local_rank
    }

    /// The master endpoint every rank agreed on.
    pub fn master_addr_port(&self) -> (String, u16) {
        // bootstrap() always sets both before constructing the Worker
        (
            self.config.master_addr.clone().unwrap_or_default(),
            self.config.master_port.unwrap_or_default(),
        )
    }

    /// Accelerator visibility string, if assigned.
    pub fn cuda_visible_devices(&self) -> Option<&str> {
        self.config.cuda_visible_devices.as_deref()
    }

    /// The frozen bootstrap configuration.
    pub fn config(&self) -> &WorkerBootstrapConfig {
        &self.config
    }

    /// Handle to the shared register center; `None` when worker init was
    /// disabled.
    pub fn register_center(&self) -> Option<&RegisterCenterHandle> {
        self.register_center.as_ref()
    }
}
