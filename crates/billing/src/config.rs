//! Reconciler configuration

use std::str::FromStr;

use crate::error::{BillingError, BillingResult};
use crate::signature::DEFAULT_TOLERANCE_SECS;

/// Which Stripe mode this deployment reconciles.
///
/// Events whose `livemode` flag does not match are recorded and acknowledged
/// but never applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingMode {
    #[default]
    Live,
    Test,
}

impl BillingMode {
    pub fn accepts(&self, livemode: bool) -> bool {
        match self {
            BillingMode::Live => livemode,
            BillingMode::Test => !livemode,
        }
    }
}

impl FromStr for BillingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(BillingMode::Live),
            "test" => Ok(BillingMode::Test),
            other => Err(BillingError::Config(format!(
                "BILLING_MODE must be 'live' or 'test', got '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BillingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingMode::Live => write!(f, "live"),
            BillingMode::Test => write!(f, "test"),
        }
    }
}

/// What to do with an event older than the last one applied to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleEventPolicy {
    /// Overwrite with the latest received snapshot (logged as a warning)
    #[default]
    Apply,
    /// Keep the stored state and acknowledge the event
    Skip,
}

impl FromStr for StaleEventPolicy {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply" => Ok(StaleEventPolicy::Apply),
            "skip" => Ok(StaleEventPolicy::Skip),
            other => Err(BillingError::Config(format!(
                "STALE_EVENT_POLICY must be 'apply' or 'skip', got '{}'",
                other
            ))),
        }
    }
}

/// Behavioural settings for the webhook reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub mode: BillingMode,
    pub stale_event_policy: StaleEventPolicy,
    pub signature_tolerance_secs: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            mode: BillingMode::Live,
            stale_event_policy: StaleEventPolicy::Apply,
            signature_tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl ReconcilerConfig {
    /// Read optional settings from the environment; unset values keep defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let mode = match std::env::var("BILLING_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.mode,
        };

        let stale_event_policy = match std::env::var("STALE_EVENT_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.stale_event_policy,
        };

        let signature_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(value) => value.trim().parse().map_err(|_| {
                BillingError::Config(format!(
                    "WEBHOOK_TOLERANCE_SECS must be an integer, got '{}'",
                    value
                ))
            })?,
            Err(_) => defaults.signature_tolerance_secs,
        };

        Ok(Self {
            mode,
            stale_event_policy,
            signature_tolerance_secs,
        })
    }
}
