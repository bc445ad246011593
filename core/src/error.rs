use crate::types::{ExperimentId, VariantId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input for '{subject}': {reason}")]
    InvalidInput { subject: String, reason: String },

    #[error("Experiment '{experiment_id}' is {state}")]
    InvalidExperimentState {
        experiment_id: ExperimentId,
        state:         String,
    },

    #[error("Variant '{variant_id}' is not part of experiment '{experiment_id}'")]
    UnknownVariant {
        experiment_id: ExperimentId,
        variant_id:    VariantId,
    },

    #[error("Invalid correction rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Function '{0}' is not registered with the variance controller")]
    UnknownFunction(String),

    #[error("Correction event '{0}' not found")]
    UnknownCorrectionEvent(String),

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Cycle '{0}' was cancelled before publishing")]
    CycleCancelled(&'static str),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_input(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            subject: subject.into(),
            reason:  reason.into(),
        }
    }

    pub fn invalid_rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule_id: rule_id.into(),
            reason:  reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
