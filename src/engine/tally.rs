use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::warn;

use crate::error::Result;
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::model::{
    api::{
        audit::{TallyAudit, TallyMismatch},
        results::{ResultsSummary, TallyEntry},
    },
    common::{CandidateId, VoterId},
    db::Candidate,
};

/// Read-only views over the candidate tallies.
///
/// Nothing here takes a lock, so results may trail a ballot that is being
/// committed concurrently.
pub struct TallyReader {
    ledger: Arc<dyn Ledger>,
}

impl TallyReader {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Every candidate with their tally, most votes first. Ties keep
    /// candidate creation order. Pass an `election_id` to see only that
    /// election's candidates.
    pub async fn read_results(&self, election_id: Option<&str>) -> Result<Vec<TallyEntry>> {
        Ok(rank(self.ledger.tallies(election_id).await?))
    }

    pub async fn summary(&self, election_id: Option<&str>) -> Result<ResultsSummary> {
        let candidates = self.read_results(election_id).await?;
        Ok(ResultsSummary::new(
            election_id.map(str::to_string),
            candidates,
        ))
    }

    /// Check the tallies against the ballot ledger, as of a single point in
    /// time.
    pub async fn audit(&self) -> Result<TallyAudit> {
        let audit = audit_snapshot(&self.ledger.snapshot().await?);
        if !audit.consistent {
            warn!("Tally audit found inconsistencies: {audit:?}");
        }
        Ok(audit)
    }
}

/// Order candidates for publication.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<TallyEntry> {
    candidates.sort_by_key(|c| (Reverse(c.vote_count), c.id));
    candidates.into_iter().map(TallyEntry::from).collect()
}

pub fn audit_snapshot(snapshot: &LedgerSnapshot) -> TallyAudit {
    let mut counted: BTreeMap<CandidateId, u64> = BTreeMap::new();
    let mut ballots_per_voter: BTreeMap<VoterId, u64> = BTreeMap::new();
    for ballot in &snapshot.ballots {
        *counted.entry(ballot.candidate_id).or_default() += 1;
        *ballots_per_voter.entry(ballot.voter_id).or_default() += 1;
    }

    let mut mismatched_tallies = Vec::new();
    let mut known = BTreeSet::new();
    for candidate in &snapshot.candidates {
        known.insert(candidate.id);
        let counted = counted.get(&candidate.id).copied().unwrap_or_default();
        if counted != candidate.vote_count {
            mismatched_tallies.push(TallyMismatch {
                candidate_id: candidate.id,
                recorded: candidate.vote_count,
                counted,
            });
        }
    }
    mismatched_tallies.sort_by_key(|m| m.candidate_id);

    let unknown_candidates = counted
        .keys()
        .filter(|id| !known.contains(id))
        .copied()
        .collect::<Vec<_>>();
    let voters_without_ballot = snapshot
        .voted
        .iter()
        .filter(|id| !ballots_per_voter.contains_key(id))
        .copied()
        .collect::<Vec<_>>();
    let ballots_without_flag = ballots_per_voter
        .keys()
        .filter(|id| !snapshot.voted.contains(id))
        .copied()
        .collect::<Vec<_>>();
    let duplicate_ballots = ballots_per_voter
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(&id, _)| id)
        .collect::<Vec<_>>();

    let consistent = mismatched_tallies.is_empty()
        && unknown_candidates.is_empty()
        && voters_without_ballot.is_empty()
        && ballots_without_flag.is_empty()
        && duplicate_ballots.is_empty();

    TallyAudit {
        consistent,
        total_ballots: snapshot.ballots.len() as u64,
        total_votes: snapshot.candidates.iter().map(|c| c.vote_count).sum(),
        mismatched_tallies,
        voters_without_ballot,
        ballots_without_flag,
        duplicate_ballots,
        unknown_candidates,
    }
}
