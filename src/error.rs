/// Error taxonomy for the reward pipeline.
///
/// Per-item failures (one post, one sub-window, one author) are caught at the
/// item boundary and recorded; none of these variants should ever abort a
/// whole cycle.

use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum MentionRewardsError {
    /// Upstream provider failure. Retried with a mandatory pacing delay,
    /// never fatal to the cycle that observed it.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Malformed time range or parameter. Callers clamp rather than fail
    /// where possible, since the pipeline runs unattended.
    #[error("validation error: {0}")]
    Validation(String),

    /// The durable running flag disagrees with whether a timer is actually
    /// armed. Detected on activation and self-healed.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    /// Ledger dispatch failure. The affected reward record stays unsent;
    /// the rest of the batch proceeds.
    #[error("dispatch failed for author {author}: {reason}")]
    Dispatch { author: String, reason: String },

    #[error("state store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
