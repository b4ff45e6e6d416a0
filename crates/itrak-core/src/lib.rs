//! Core domain model and relevance filtering for the internship tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "itrak-core";

/// One discovered internship posting, as extracted from a monitored document.
///
/// Postings are append-only sightings: identity is the
/// (organization, role, application_link) triple, and re-inserting the same
/// triple is a silent no-op at the store layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub organization: String,
    pub role: String,
    pub location: String,
    /// Application URL; empty string when the row carried no apply link.
    pub application_link: String,
    pub source_id: String,
    /// Revision hash of the change the posting was extracted from.
    pub change_id: String,
    /// Section heading active when the row was parsed; may be empty.
    pub section: String,
    pub discovered_at: DateTime<Utc>,
}

/// One person believed to satisfy the affiliation criterion, tied to a single
/// organization. Identity is the profile URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPerson {
    pub name: String,
    pub headline: String,
    pub organization: String,
    pub profile_url: String,
    pub affiliation_confirmed: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Keyword/location predicates deciding whether a parsed posting is in scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Role must contain at least one of these (case-insensitive substring).
    pub internship_keywords: Vec<String>,
    /// Location must contain one of these, or "remote", or "united states".
    pub preferred_locations: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            internship_keywords: [
                "intern",
                "internship",
                "summer intern",
                "co-op",
                "coop",
                "student",
                "new grad",
                "entry level",
                "software engineer intern",
                "data science intern",
                "product manager intern",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            preferred_locations: ["Seattle", "Bellevue", "Redmond", "Remote", "United States"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FilterConfig {
    /// Keep/drop decision for a role + location pair. Pure; drops are silent.
    pub fn keeps(&self, role: &str, location: &str) -> bool {
        let role_lower = role.to_lowercase();
        let location_lower = location.to_lowercase();

        if !self
            .internship_keywords
            .iter()
            .any(|kw| role_lower.contains(&kw.to_lowercase()))
        {
            return false;
        }

        if self
            .preferred_locations
            .iter()
            .any(|loc| location_lower.contains(&loc.to_lowercase()))
        {
            return true;
        }

        location_lower.contains("remote") || location_lower.contains("united states")
    }

    pub fn keeps_posting(&self, posting: &Posting) -> bool {
        self.keeps(&posting.role, &posting.location)
    }
}
