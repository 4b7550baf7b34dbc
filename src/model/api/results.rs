use serde::{Deserialize, Serialize};

use crate::model::{common::CandidateId, db::Candidate};

/// One row of the published results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
    pub candidate_id: CandidateId,
    pub name: String,
    pub position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub vote_count: u64,
}

impl From<Candidate> for TallyEntry {
    fn from(candidate: Candidate) -> Self {
        Self {
            candidate_id: candidate.id,
            name: candidate.candidate.name,
            position: candidate.candidate.position,
            party: candidate.candidate.party,
            election_id: candidate.candidate.election_id,
            image_url: candidate.candidate.image_url,
            vote_count: candidate.candidate.vote_count,
        }
    }
}

/// Results plus the headline figure shown on dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsSummary {
    /// The election these results cover. Absent when they cover every
    /// candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_id: Option<String>,
    /// Sum of every listed candidate's tally.
    pub total_votes: u64,
    pub candidates: Vec<TallyEntry>,
}

impl ResultsSummary {
    pub fn new(election_id: Option<String>, candidates: Vec<TallyEntry>) -> Self {
        Self {
            election_id,
            total_votes: candidates.iter().map(|c| c.vote_count).sum(),
            candidates,
        }
    }
}
