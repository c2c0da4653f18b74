//! Forward engine and PPO update loop.
//!
//! Data flow for one micro-batch, packed sequence-parallel path:
//!
//! ```text
//!  [batch, seq]                 [total_tokens]            [tokens/sp]
//!  input_ids ---pack--------->  packed stream --slice-->  rank shard
//!                                                             |
//!                                                          backbone
//!                                                             |
//!  [batch, resp]               [total_tokens]            [tokens/sp]
//!  log_probs  <--unpad+slice-- gathered stream <-gather- shard values
//! ```
//!
//! The update loop drives this engine across epochs, mini-batches, and
//! micro-batches, accumulates gradients, and applies one gated optimizer
//! step per mini-batch.

pub mod forward;
pub mod grad;
pub mod logits;
pub mod padding;
pub mod policy_learner;
pub mod sequence_parallel;

pub use forward::{ForwardConfig, ForwardEngine, ForwardError, ForwardOutput, StatRequest};
pub use grad::{clip_grads, grad_l2_norm, optimizer_step};
pub use padding::PackIndex;
pub use policy_learner::{PPOConfig, PPOConfigError, PolicyLearner, UpdateError};
