use std::time::Duration;

use thiserror::Error;

use crate::tier::{ResolutionSource, Tier};

/// A single problem found while validating the permission matrix, the route
/// table or the environment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigProblem {
    #[error("route `{pattern}` is not an API route and has no fallback route")]
    MissingFallback { pattern: String },

    #[error("route `{pattern}` requires unknown feature `{feature}`")]
    UnknownFeature { pattern: String, feature: String },

    #[error("route pattern `{pattern}` must start with '/'")]
    InvalidPattern { pattern: String },

    #[error("route pattern `{pattern}` is declared more than once with the same match kind")]
    DuplicateRule { pattern: String },

    #[error("feature `{feature}` is granted to {lower} but not to {higher}")]
    FeatureNotInherited {
        feature: String,
        lower: Tier,
        higher: Tier,
    },

    #[error("limit `{limit}` decreases from {lower} ({lower_value}) to {higher} ({higher_value})")]
    LimitDecreases {
        limit: String,
        lower: Tier,
        lower_value: i64,
        higher: Tier,
        higher_value: i64,
    },

    #[error("limit `{limit}` has invalid value {value} for {tier} (use -1 for unlimited)")]
    InvalidLimit { limit: String, tier: Tier, value: i64 },

    #[error("tier {tier} is missing from the permission matrix")]
    MissingTier { tier: Tier },

    #[error("{0}")]
    Invalid(String),
}

/// Startup configuration failure. Fatal: the service must not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {}", join_problems(.problems))]
pub struct ConfigurationError {
    pub problems: Vec<ConfigProblem>,
}

impl ConfigurationError {
    pub fn new(problems: Vec<ConfigProblem>) -> Self {
        Self { problems }
    }

    pub fn single(problem: ConfigProblem) -> Self {
        Self {
            problems: vec![problem],
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::single(ConfigProblem::Invalid(msg.into()))
    }

    /// `Ok(())` when no problems were collected.
    pub fn check(problems: Vec<ConfigProblem>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

fn join_problems(problems: &[ConfigProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Lookup errors raised by [`crate::matrix::PermissionMatrix`].
///
/// Both variants indicate a configuration bug in the caller, not a user error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("unknown feature `{0}`")]
    UnknownFeature(String),

    #[error("unknown limit `{0}`")]
    UnknownLimit(String),
}

/// Non-fatal failure of a single resolver source. The resolver moves on to
/// the next source on either variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("{stage} exceeded its {budget:?} budget")]
    Timeout {
        stage: ResolutionSource,
        budget: Duration,
    },

    #[error("{stage} unavailable: {reason}")]
    Unavailable {
        stage: ResolutionSource,
        reason: String,
    },
}

impl SourceError {
    pub fn unavailable(stage: ResolutionSource, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            stage,
            reason: err.to_string(),
        }
    }

    pub fn stage(&self) -> ResolutionSource {
        match self {
            SourceError::Timeout { stage, .. } | SourceError::Unavailable { stage, .. } => *stage,
        }
    }
}
