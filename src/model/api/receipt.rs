use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{CandidateId, VoterId},
    db::Ballot,
};

/// Proof that a ballot was committed, returned to the voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Hex-encoded ballot ID.
    pub ballot_id: String,
    pub voter_id: VoterId,
    pub candidate_id: CandidateId,
    pub cast_at: DateTime<Utc>,
}

impl From<Ballot> for Receipt {
    fn from(ballot: Ballot) -> Self {
        Self {
            ballot_id: ballot.id.to_string(),
            voter_id: ballot.voter_id,
            candidate_id: ballot.candidate_id,
            cast_at: ballot.cast_at,
        }
    }
}
