//! Worker identity and rendezvous.
//!
//! Every training process resolves a [`Worker`] exactly once at startup:
//! rank 0 publishes a master endpoint through a [`RegisterCenter`], all other
//! ranks read it back, and every rank registers its node placement so an
//! external scheduler can reason about affinity.
//!
//! ```text
//! rank 0                      RegisterCenter                 rank 1..N-1
//! ┌──────────────┐            ┌──────────────┐              ┌────────────┐
//! │ resolve addr │──create───►│ MasterInfo   │◄───lookup────│ bootstrap  │
//! │ + free port  │            │ rank→node_id │              │            │
//! └──────────────┘            └──────────────┘              └────────────┘
//!        │                           ▲                            │
//!        └────────set_worker_info────┴────────set_worker_info─────┘
//! ```
//!
//! Creation ordering is the caller's problem: the launcher must start rank 0
//! before other ranks attempt the lookup. The registry does not implement a
//! barrier, a timeout, or a retry.

pub mod bootstrap;
pub mod network;
pub mod register_center;
pub mod worker;

pub use bootstrap::{BootstrapError, WorkerBootstrapConfig};
pub use register_center::{
    LocalRegistry, MasterInfo, RegisterCenter, RegisterCenterHandle, RegistryStore,
    RendezvousError,
};
pub use worker::{GlobalInfo, RankInfo, Worker};
