//! Routing and rebalancing error types

use crate::planner::PlannerState;
use thiserror::Error;

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RouteError>;

/// Routing and rebalancing errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Metric Collection Errors ====================
    #[error("invalid instance index {index} (parallelism {parallelism})")]
    InvalidInstance { index: usize, parallelism: u32 },

    #[error("invalid load estimate {load} for key {key}")]
    InvalidLoad { key: String, load: f64 },

    #[error("round closed: planner is {state}")]
    IncompleteRound { state: PlannerState },

    #[error("round not complete: {reported} of {required} instances reported")]
    RoundNotComplete { reported: usize, required: usize },

    // ==================== Planning Errors ====================
    #[error("partition index {partition} out of range (parallelism {parallelism})")]
    InvalidPartitionIndex { partition: u32, parallelism: u32 },

    #[error("no migration plan in flight")]
    NoActivePlan,

    // ==================== Internal Errors ====================
    #[error("driver task failed: {0}")]
    DriverFailed(String),
}

impl RouteError {
    /// Check if the caller may retry the operation in a later round
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RouteError::IncompleteRound { .. } | RouteError::RoundNotComplete { .. }
        )
    }

    /// Check if this error is an algorithmic invariant violation
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouteError::InvalidPartitionIndex { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(RouteError::IncompleteRound {
            state: PlannerState::Migrating
        }
        .is_retriable());
        assert!(RouteError::RoundNotComplete {
            reported: 1,
            required: 4
        }
        .is_retriable());
        assert!(!RouteError::InvalidConfig("bad".into()).is_retriable());
        assert!(!RouteError::InvalidInstance {
            index: 9,
            parallelism: 4
        }
        .is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(RouteError::InvalidPartitionIndex {
            partition: 7,
            parallelism: 4
        }
        .is_fatal());
        assert!(!RouteError::NoActivePlan.is_fatal());
        assert!(!RouteError::NoActivePlan.is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = RouteError::IncompleteRound {
            state: PlannerState::Migrating,
        };
        assert_eq!(err.to_string(), "round closed: planner is migrating");

        let err = RouteError::RoundNotComplete {
            reported: 2,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "round not complete: 2 of 3 instances reported"
        );
    }
}
