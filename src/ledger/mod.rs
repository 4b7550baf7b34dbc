//! The storage boundary the ballot engine is written against.
//!
//! A [`Ledger`] owns three kinds of record: voters, candidates (with their
//! running tallies) and ballots. Reads go straight to the ledger; every
//! mutation happens inside a [`UnitOfWork`], which is applied in full on
//! [`UnitOfWork::commit`] or not at all.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{
    common::{CandidateId, VoterId},
    db::{Ballot, Candidate, Voter},
};

mod memory;
mod mongo;

pub use memory::{FaultKind, FaultPoint, MemoryLedger};
pub use mongo::MongoLedger;

#[rocket::async_trait]
pub trait Ledger: Send + Sync {
    /// Begin a new atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>>;

    /// Read a voter as of the last commit.
    async fn voter(&self, id: VoterId) -> Result<Option<Voter>>;

    /// Read a candidate as of the last commit.
    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>>;

    /// Candidates with their current tallies, in no particular order.
    /// Limited to one election if `election_id` is given. Takes no locks, so
    /// the tallies may trail in-flight commits.
    async fn tallies(&self, election_id: Option<&str>) -> Result<Vec<Candidate>>;

    /// The ballot cast by the given voter, if any.
    async fn ballot_for_voter(&self, id: VoterId) -> Result<Option<Ballot>>;

    /// A mutually consistent view of every candidate, every ballot, and every
    /// voter that has been marked as voted.
    async fn snapshot(&self) -> Result<LedgerSnapshot>;
}

/// One atomic group of ledger mutations.
///
/// Dropping a unit of work without committing it discards its effects, but
/// callers should prefer [`UnitOfWork::rollback`] so that backend errors are
/// observed.
#[rocket::async_trait]
pub trait UnitOfWork: Send {
    /// Read a voter for update. Once this returns, the eligibility decision
    /// made on the result holds until this unit of work ends: either the
    /// voter row is locked, or a concurrent change will make the commit fail
    /// with a transient error.
    async fn lock_voter(&mut self, id: VoterId) -> Result<Option<Voter>>;

    /// Flip the voter's `has_voted` flag. Returns `false` if it was already set.
    async fn mark_voted(&mut self, id: VoterId) -> Result<bool>;

    /// Record a ballot. A second ballot for the same voter is rejected.
    async fn insert_ballot(&mut self, ballot: &Ballot) -> Result<()>;

    /// Atomically add one to the candidate's tally. Returns `false` if no such
    /// candidate exists.
    async fn increment_vote_count(&mut self, id: CandidateId) -> Result<bool>;

    /// Apply every mutation made in this unit of work.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every mutation made in this unit of work.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A point-in-time copy of the ledger, used for auditing.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub candidates: Vec<Candidate>,
    pub ballots: Vec<Ballot>,
    /// Voters whose `has_voted` flag is set.
    pub voted: BTreeSet<VoterId>,
}
