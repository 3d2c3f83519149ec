pub mod config;
pub mod decision;
pub mod error;
pub mod matrix;
pub mod route;
pub mod source;
pub mod tier;

pub use decision::{AccessDecisionEngine, ReasonCode, RoutingDecision};
pub use error::{ConfigProblem, ConfigurationError, MatrixError, SourceError};
pub use matrix::PermissionMatrix;
pub use route::{MatchKind, PathMatcher, RouteRule, RouteTable};
pub use tier::{ResolutionSource, SubscriptionStatus, Tier, TierDetectionResult};
