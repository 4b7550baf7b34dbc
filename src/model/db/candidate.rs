use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::model::common::CandidateId;

/// Core candidate data, as stored in the database.
///
/// Display attributes beyond `name` and `position` are optional, so records
/// written with or without them both load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCore {
    pub name: String,
    pub position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Number of ballots cast for this candidate. Only ever incremented.
    #[serde(default)]
    pub vote_count: u64,
}

impl CandidateCore {
    pub fn new(name: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: position.into(),
            party: None,
            election_id: None,
            image_url: None,
            vote_count: 0,
        }
    }
}

/// A candidate from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "_id")]
    pub id: CandidateId,
    #[serde(flatten)]
    pub candidate: CandidateCore,
}

impl Deref for Candidate {
    type Target = CandidateCore;

    fn deref(&self) -> &Self::Target {
        &self.candidate
    }
}

impl DerefMut for Candidate {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.candidate
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl Candidate {
        pub fn example(id: CandidateId, name: &str) -> Self {
            Self {
                id,
                candidate: CandidateCore::new(name, "President"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, from_document};

    use super::*;

    #[test]
    fn minimal_record_loads() {
        let document = doc! {
            "_id": 3,
            "name": "Candidate C",
            "position": "General Secretary",
        };
        let candidate: Candidate = from_document(document).unwrap();
        assert_eq!(candidate.id, 3);
        assert_eq!(candidate.vote_count, 0);
        assert_eq!(candidate.party, None);
    }

    #[test]
    fn full_record_loads() {
        let document = doc! {
            "_id": 1,
            "name": "Candidate A",
            "position": "President",
            "party": "Blue",
            "election_id": "2024-general",
            "image_url": "/images/a.png",
            "vote_count": 12_i64,
        };
        let candidate: Candidate = from_document(document).unwrap();
        assert_eq!(candidate.party.as_deref(), Some("Blue"));
        assert_eq!(candidate.election_id.as_deref(), Some("2024-general"));
        assert_eq!(candidate.vote_count, 12);
    }
}
