//! # Distributed RLHF Training Core
//!
//! Worker rendezvous and PPO micro-batch updates for RLHF post-training,
//! backend-agnostic over `burn` tensors.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Distributed RLHF Job                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Rank 0                 Rank 1                 Rank N               │
//! │  ┌───────────┐          ┌───────────┐          ┌───────────┐       │
//! │  │ Worker    │          │ Worker    │          │ Worker    │       │
//! │  │ resolve   │ publish  │ lookup    │          │ lookup    │       │
//! │  │ addr+port ├────┐     │ master    │          │ master    │       │
//! │  └───────────┘    ▼     └─────┬─────┘          └─────┬─────┘       │
//! │            ┌──────────────┐   │                      │             │
//! │            │RegisterCenter│◄──┴──────────────────────┘             │
//! │            │ (MasterInfo, │   every rank publishes (rank, node)    │
//! │            │  rank→node)  │                                        │
//! │            └──────────────┘                                        │
//! │                                                                    │
//! │  Per rank:                                                         │
//! │  TrainingBatch ─► mini-batches ─► micro-batches (fixed or token    │
//! │  budget) ─► ForwardEngine (pack / shard / gather / unpad) ─►       │
//! │  dual-clip PPO loss ─► accumulated grads ─► gated optimizer step   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use distributed_rlhf::{
//!     ForwardConfig, ForwardEngine, LocalRegistry, NoSequenceParallel, PPOConfig,
//!     PolicyLearner, Worker, WorkerBootstrapConfig,
//! };
//!
//! let registry = LocalRegistry::new();
//! let worker = Worker::bootstrap(WorkerBootstrapConfig::from_env()?, &registry, "wg")?;
//!
//! let engine = ForwardEngine::new(ForwardConfig::new(), NoSequenceParallel);
//! let config = PPOConfig::new()
//!     .with_mini_batch_size(256)
//!     .with_micro_batch_size(8)
//!     .with_clip_ratio(0.2);
//! let learner = PolicyLearner::new(config, engine, worker.rank())?;
//! let (model, metrics) = learner.update_policy(model, &mut optimizer, &ori, &aug)?;
//! ```

pub mod algorithms;
pub mod data;
pub mod learner;
pub mod metrics;
pub mod model;
pub mod rendezvous;

// Re-export commonly used types
pub use rendezvous::{
    BootstrapError, GlobalInfo, LocalRegistry, MasterInfo, RankInfo, RegisterCenter,
    RegisterCenterHandle, RegistryStore, RendezvousError, Worker, WorkerBootstrapConfig,
};

pub use data::{BatchMeta, DynamicBatchError, TrainingBatch};

pub use model::{FusedOutput, NoSequenceParallel, PolicyBackbone, SequenceParallel};

pub use learner::{
    ForwardConfig, ForwardEngine, ForwardError, ForwardOutput, PPOConfig, PPOConfigError,
    PolicyLearner, StatRequest, UpdateError,
};

pub use algorithms::{KlPenaltyKind, LossAggMode, PolicyLossConfig, PolicyLossOutput};

pub use metrics::MetricsAccumulator;
