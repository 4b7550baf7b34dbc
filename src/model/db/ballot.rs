use std::ops::Deref;

use chrono::{DateTime, SubsecRound, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{CandidateId, VoterId},
    mongodb::Id,
};

/// Core ballot data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotCore {
    /// Foreign Key voter ID. Unique across the ledger.
    pub voter_id: VoterId,
    /// Foreign Key candidate ID.
    pub candidate_id: CandidateId,
    /// When the ballot was cast.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub cast_at: DateTime<Utc>,
}

/// A ballot from the database, with its unique ID.
///
/// Ballots are immutable once written, so there is no `DerefMut`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub ballot: BallotCore,
}

impl Ballot {
    /// Create a new ballot with a fresh ID.
    ///
    /// BSON datetimes hold milliseconds, so `cast_at` is truncated to match
    /// what the database will store.
    pub fn new(voter_id: VoterId, candidate_id: CandidateId, cast_at: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            ballot: BallotCore {
                voter_id,
                candidate_id,
                cast_at: cast_at.trunc_subsecs(3),
            },
        }
    }
}

impl Deref for Ballot {
    type Target = BallotCore;

    fn deref(&self) -> &Self::Target {
        &self.ballot
    }
}
