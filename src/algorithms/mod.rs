//! Loss functions for policy optimization.

pub mod policy_loss;

pub use policy_loss::{
    agg_loss, compute_policy_loss, kl_penalty, masked_mean, KlPenaltyKind, LossAggMode,
    PolicyLossConfig, PolicyLossConfigError, PolicyLossError, PolicyLossOutput,
};
