use serde::{Deserialize, Serialize};

use crate::model::common::{CandidateId, VoterId};

/// A candidate whose stored tally disagrees with the ballots cast for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyMismatch {
    pub candidate_id: CandidateId,
    /// The candidate's `vote_count`.
    pub recorded: u64,
    /// The number of ballots naming the candidate.
    pub counted: u64,
}

/// The result of checking every tally against the ballot ledger.
///
/// All lists are sorted by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyAudit {
    /// True iff every list below is empty.
    pub consistent: bool,
    pub total_ballots: u64,
    /// Sum of every candidate's `vote_count`.
    pub total_votes: u64,
    pub mismatched_tallies: Vec<TallyMismatch>,
    /// Voters flagged `has_voted` with no ballot on record.
    pub voters_without_ballot: Vec<VoterId>,
    /// Voters with a ballot on record who are not flagged `has_voted`.
    pub ballots_without_flag: Vec<VoterId>,
    /// Voters with more than one ballot.
    pub duplicate_ballots: Vec<VoterId>,
    /// Candidates named on a ballot that do not exist.
    pub unknown_candidates: Vec<CandidateId>,
}
