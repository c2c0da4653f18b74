//! Name-addressed registry for worker-group rendezvous.
//!
//! The register center is the only cross-process mutable shared resource in
//! this crate. Rank 0 creates it with the master endpoint; every other rank
//! looks it up by name and reads the endpoint back. All writes are either
//! write-once (the master info, fixed at creation) or idempotent per key
//! (`set_worker_info`), so no locking beyond the registry's own serialized
//! access is required.
//!
//! [`RegistryStore`] is the narrow key-value interface a transport must
//! provide; [`LocalRegistry`] is the in-process implementation used for
//! single-node jobs and tests. A job-wide transport (an actor system, a
//! networked KV store) is an external collaborator that implements the same
//! three operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Master endpoint published by rank 0 at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    /// Master address. May be an IPv6 literal; consumers strip brackets.
    pub addr: String,
    /// Master port, OS-assigned on rank 0.
    pub port: u16,
}

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousError {
    /// `create` was called for a name that already exists.
    AlreadyRegistered(String),
    /// `lookup` was called before rank 0 created the center.
    NotFound(String),
}

impl std::fmt::Display for RendezvousError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendezvousError::AlreadyRegistered(name) => {
                write!(f, "register center {:?} already exists", name)
            }
            RendezvousError::NotFound(name) => {
                write!(f, "register center {:?} not found (rank 0 must create it first)", name)
            }
        }
    }
}

impl std::error::Error for RendezvousError {}

/// One register center: the master endpoint plus per-rank node placement.
#[derive(Debug)]
pub struct RegisterCenter {
    master: MasterInfo,
    workers: RwLock<HashMap<usize, String>>,
}

impl RegisterCenter {
    /// Create a center holding the given master endpoint.
    pub fn new(master: MasterInfo) -> Self {
        Self {
            master,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// The master endpoint, written once at creation.
    pub fn master_info(&self) -> &MasterInfo {
        &self.master
    }

    /// Record the node hosting `rank`. Idempotent, last write wins.
    pub fn set_worker_info(&self, rank: usize, node_id: &str) {
        self.workers.write().insert(rank, node_id.to_string());
    }

    /// Node identifier registered for `rank`, if any.
    ///
    /// Nothing in this crate reads these back; they exist for external
    /// schedulers doing node-affinity placement.
    pub fn worker_info(&self, rank: usize) -> Option<String> {
        self.workers.read().get(&rank).cloned()
    }

    /// Number of ranks that have registered placement info.
    pub fn registered_workers(&self) -> usize {
        self.workers.read().len()
    }
}

/// Shared handle to a register center.
pub type RegisterCenterHandle = Arc<RegisterCenter>;

/// The key-value contract a rendezvous transport must provide.
pub trait RegistryStore {
    /// Create a center under `name`. Rank-0 only; fails if the name exists.
    fn create(
        &self,
        name: &str,
        master: MasterInfo,
    ) -> Result<RegisterCenterHandle, RendezvousError>;

    /// Look up an existing center. Fails if it has not been created yet;
    /// there is no built-in wait or retry.
    fn lookup(&self, name: &str) -> Result<RegisterCenterHandle, RendezvousError>;
}

/// In-process registry keyed by name.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    centers: RwLock<HashMap<String, RegisterCenterHandle>>,
}

impl LocalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for LocalRegistry {
    fn create(
        &self,
        name: &str,
        master: MasterInfo,
    ) -> Result<RegisterCenterHandle, RendezvousError> {
        let mut centers = self.centers.write();
        if centers.contains_key(name) {
            return Err(RendezvousError::AlreadyRegistered(name.to_string()));
        }
        let handle = Arc::new(RegisterCenter::new(master));
        centers.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn lookup(&self, name: &str) -> Result<RegisterCenterHandle, RendezvousError> {
        self.centers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RendezvousError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterInfo {
        MasterInfo {
            addr: "10.0.0.1".to_string(),
            port: 29500,
        }
    }

    #[test]
    fn test_create_then_lookup() {
        let registry = LocalRegistry::new();
        let created = registry.create("wg_register_center", master()).unwrap();
        let found = registry.lookup("wg_register_center").unwrap();

        assert_eq!(found.master_info(), created.master_info());
        assert_eq!(found.master_info().port, 29500);
    }

    #[test]
    fn test_lookup_before_create_fails() {
        let registry = LocalRegistry::new();
        let err = registry.lookup("missing").unwrap_err();
        assert_eq!(err, RendezvousError::NotFound("missing".to_string()));
    }

    #[test]
    fn test_duplicate_create_fails() {
        let registry = LocalRegistry::new();
        registry.create("wg", master()).unwrap();
        let err = registry.create("wg", master()).unwrap_err();
        assert_eq!(err, RendezvousError::AlreadyRegistered("wg".to_string()));
    }

    #[test]
    fn test_set_worker_info_last_write_wins() {
        let center = RegisterCenter::new(master());
        center.set_worker_info(3, "node-a");
        center.set_worker_info(3, "node-b");

        assert_eq!(center.worker_info(3), Some("node-b".to_string()));
        assert_eq!(center.worker_info(0), None);
        assert_eq!(center.registered_workers(), 1);
    }

    #[test]
    fn test_handle_shares_state() {
        let registry = LocalRegistry::new();
        let h1 = registry.create("wg", master()).unwrap();
        let h2 = registry.lookup("wg").unwrap();

        h1.set_worker_info(0, "node-0");
        assert_eq!(h2.worker_info(0), Some("node-0".to_string()));
    }
}
