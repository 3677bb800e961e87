//! Error taxonomy for the council pipeline.
//!
//! Stage and provider failures are values, not panics: the fan-out
//! harness converts everything into per-provider statuses, and the
//! pipeline runtime converts stage failures into a terminal job state
//! carrying one of these kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouncilError {
    /// A stage was invoked without one of its declared context inputs.
    #[error("stage {stage}: missing required context key '{key}'")]
    Precondition { stage: &'static str, key: &'static str },

    /// A stage returned without producing one of its declared outputs.
    #[error("stage {stage}: declared output '{key}' was not produced")]
    Contract { stage: &'static str, key: &'static str },

    /// Provider output failed schema/semantic validation after the
    /// single repair round.
    #[error("stage {stage}: output failed validation after repair: {detail}")]
    Validation { stage: &'static str, detail: String },

    /// Network / protocol failure talking to an external service.
    #[error("provider {provider}: transport failure: {detail}")]
    ProviderTransport { provider: String, detail: String },

    /// Per-call wall clock exceeded.
    #[error("provider {provider}: timed out after {secs}s")]
    ProviderTimeout { provider: String, secs: u64 },

    /// Too few usable provider results for the stage to proceed.
    #[error("stage {stage}: {detail}")]
    PartialProviderFailure { stage: &'static str, detail: String },

    /// The job's cancellation token fired.
    #[error("job cancelled")]
    Cancelled,

    /// Event append failed during a fatal stage write.
    #[error("event append failed: {0}")]
    Persistence(String),

    /// Invalid roster, missing accounts, unknown instruments, bad mode.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CouncilError {
    /// Stable machine-readable kind, surfaced in job error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CouncilError::Precondition { .. } => "precondition_error",
            CouncilError::Contract { .. } => "contract_error",
            CouncilError::Validation { .. } => "validation_error",
            CouncilError::ProviderTransport { .. } => "provider_transport_error",
            CouncilError::ProviderTimeout { .. } => "provider_timeout_error",
            CouncilError::PartialProviderFailure { .. } => "partial_provider_failure",
            CouncilError::Cancelled => "cancellation_error",
            CouncilError::Persistence(_) => "persistence_error",
            CouncilError::Configuration(_) => "configuration_error",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CouncilError::Cancelled)
    }
}
