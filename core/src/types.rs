//! Shared primitive types used across every engine.

use chrono::{DateTime, Utc};

/// Wall-clock instant. All engine timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Stable identifier of a donor record in the external store.
pub type DonorId = String;

/// Identifier of a bandit experiment.
pub type ExperimentId = String;

/// Identifier of a variant within one experiment.
pub type VariantId = String;

/// Identifier of a metered platform function (e.g. "donor_outreach_sms").
pub type FunctionCode = String;

/// Identifier of a correction rule.
pub type RuleId = String;
