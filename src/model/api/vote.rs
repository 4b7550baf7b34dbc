use serde::{Deserialize, Serialize};

use crate::model::common::{CandidateId, VoterId};

/// A request to cast a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Older clients send this as `user_id`.
    #[serde(alias = "user_id")]
    pub voter_id: VoterId,
    pub candidate_id: CandidateId,
}
