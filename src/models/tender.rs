//! Tenders: the billable resource behind the public API.
//!
//! The tender tables belong to the dashboard. This crate only reads them for the
//! billed endpoints and moves their review phase forward when an analysis run
//! completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATUS_ANALYZED: &str = "ANALYZED";
pub const PHASE_NEW: &str = "NEW";
pub const PHASE_PRE_SCREENING: &str = "PRE_SCREENING";
pub const PHASE_REJECTED: &str = "REJECTED";
/// Analysis verdict that sends a tender straight to `REJECTED`.
pub const OPPORTUNITY_REJECT: &str = "PRE_SCREENING_REJECT";

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Tender {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub tenant_id: Uuid,
    pub title: String,
    pub agency: String,
    /// Two-letter state code
    pub state: Option<String>,
    pub estimated_value: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub status: String,
    pub review_phase: String,
    /// Analysis priority, `P1` (best) to `P4`
    pub priority: Option<String>,
    pub opportunity_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tender {
    pub fn is_analyzed(&self) -> bool {
        self.priority.is_some() || self.opportunity_type.is_some()
    }

    /// Review phase an analyzed `NEW` tender moves to, if any.
    ///
    /// Only tenders still in `NEW` move, which is what makes repeating the
    /// advance after a retried callback harmless.
    pub fn next_review_phase(&self) -> Option<&'static str> {
        if self.review_phase != PHASE_NEW || !self.is_analyzed() {
            return None;
        }
        if self.opportunity_type.as_deref() == Some(OPPORTUNITY_REJECT) {
            return Some(PHASE_REJECTED);
        }
        match self.priority.as_deref() {
            Some("P1") | Some("P2") => Some(PHASE_PRE_SCREENING),
            _ => None,
        }
    }
}

/// Query string of `GET /api/v1/tenders`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenderQuery {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Case-insensitive match on title or agency
    #[serde(default)]
    pub search: Option<String>,
}

impl TenderQuery {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    /// Page size between 1 and 100, 20 by default.
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.limit()
    }

    pub fn matches(&self, tender: &Tender) -> bool {
        if let Some(status) = &self.status {
            if &tender.status != status {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if tender.state.as_ref() != Some(state) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !tender.title.to_lowercase().contains(&needle)
                && !tender.agency.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Serialize)]
pub struct TenderPage {
    pub data: Vec<Tender>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        Self {
            page,
            limit,
            total,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

/// Aggregates served by `GET /api/v1/stats`.
#[derive(Debug, Default, Serialize)]
pub struct TenderStats {
    pub total: i64,
    pub analyzed: i64,
    pub new: i64,
    pub total_estimated_value: f64,
    pub by_state: Vec<(String, i64)>,
    pub by_priority: Vec<(String, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tender(phase: &str, priority: Option<&str>, kind: Option<&str>) -> Tender {
        Tender {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            title: "Road maintenance".into(),
            agency: "City of Campinas".into(),
            state: Some("SP".into()),
            estimated_value: Some(1000.0),
            published_at: None,
            closes_at: None,
            status: "NEW".into(),
            review_phase: phase.into(),
            priority: priority.map(Into::into),
            opportunity_type: kind.map(Into::into),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn high_priority_moves_to_pre_screening() {
        assert_eq!(tender("NEW", Some("P1"), None).next_review_phase(), Some(PHASE_PRE_SCREENING));
        assert_eq!(tender("NEW", Some("P3"), None).next_review_phase(), None);
    }

    #[test]
    fn reject_verdict_wins_over_priority() {
        let t = tender("NEW", Some("P1"), Some(OPPORTUNITY_REJECT));
        assert_eq!(t.next_review_phase(), Some(PHASE_REJECTED));
    }

    #[test]
    fn only_new_tenders_move() {
        assert_eq!(tender("PRE_SCREENING", Some("P1"), None).next_review_phase(), None);
        assert_eq!(tender("NEW", None, None).next_review_phase(), None);
    }

    #[test]
    fn query_paging_is_bounded() {
        let q = TenderQuery { page: Some(0), limit: Some(1000), ..Default::default() };
        assert_eq!(q.page(), 1);
        assert_eq!(q.limit(), 100);
        assert_eq!(Pagination::new(2, 20, 41).total_pages, 3);
    }
}
