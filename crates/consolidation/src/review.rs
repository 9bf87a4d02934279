//! Review queue lifecycle.

use serde::{Deserialize, Serialize};

use crate::events::ReviewDecision;

/// Lifecycle of a queued merge candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Deferred,
    /// One of the pair's entities was merged or split before review.
    Expired,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Deferred => "deferred",
            ReviewStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            "deferred" => Some(ReviewStatus::Deferred),
            "expired" => Some(ReviewStatus::Expired),
            _ => None,
        }
    }

    /// Map a reviewer decision to the resulting status.
    /// `mark_different` records the pair as non-duplicates, so it rejects.
    pub fn from_decision(decision: ReviewDecision) -> Self {
        match decision {
            ReviewDecision::Approve => ReviewStatus::Approved,
            ReviewDecision::Reject | ReviewDecision::MarkDifferent => ReviewStatus::Rejected,
            ReviewDecision::Defer => ReviewStatus::Deferred,
        }
    }
}

/// Filters for listing review items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewFilters {
    pub status: Option<ReviewStatus>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub entity_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Aggregate statistics over a tenant's review queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatistics {
    pub total: u64,
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub expired: u64,
    pub average_confidence: Option<f64>,
    /// Age in seconds of the oldest still-pending item.
    pub oldest_pending_age_seconds: Option<i64>,
    pub by_entity_type: std::collections::HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_map_to_statuses() {
        assert_eq!(
            ReviewStatus::from_decision(ReviewDecision::Approve),
            ReviewStatus::Approved
        );
        assert_eq!(
            ReviewStatus::from_decision(ReviewDecision::Reject),
            ReviewStatus::Rejected
        );
        assert_eq!(
            ReviewStatus::from_decision(ReviewDecision::MarkDifferent),
            ReviewStatus::Rejected
        );
        assert_eq!(
            ReviewStatus::from_decision(ReviewDecision::Defer),
            ReviewStatus::Deferred
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Approved,
            ReviewStatus::Rejected,
            ReviewStatus::Deferred,
            ReviewStatus::Expired,
        ] {
            assert_eq!(ReviewStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReviewStatus::parse("bogus"), None);
    }
}
