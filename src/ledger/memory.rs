use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use log::trace;
use rocket::tokio::{
    sync::{Mutex, OwnedMutexGuard, RwLock},
    time::timeout,
};

use crate::error::{Error, Rejection, Result};
use crate::model::{
    common::{CandidateId, VoterId},
    db::{Ballot, Candidate, Voter},
};

use super::{Ledger, LedgerSnapshot, UnitOfWork};

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    LockVoter,
    MarkVoted,
    InsertBallot,
    IncrementVoteCount,
    Commit,
}

/// What an injected fault looks like to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Fatal,
    /// At [`FaultPoint::Commit`], the writes are applied but the caller is
    /// told the commit failed transiently, like a lost acknowledgement.
    /// Anywhere else it behaves like `Transient`.
    LostAck,
}

impl FaultKind {
    fn into_error(self, point: FaultPoint) -> Error {
        let message = format!("Injected fault at {point:?}");
        match self {
            Self::Transient | Self::LostAck => Error::TransientStorage(message),
            Self::Fatal => Error::FatalStorage(message),
        }
    }
}

/// A voter record plus its row lock. The flag lives outside the record so
/// readers never need the lock.
struct VoterRow {
    record: Voter,
    has_voted: AtomicBool,
    lock: Arc<Mutex<()>>,
}

impl VoterRow {
    fn load(&self) -> Voter {
        let mut voter = self.record.clone();
        voter.has_voted = self.has_voted.load(Ordering::SeqCst);
        voter
    }
}

/// A candidate record plus its row lock.
struct CandidateRow {
    record: Candidate,
    vote_count: AtomicU64,
    lock: Arc<Mutex<()>>,
}

impl CandidateRow {
    fn load(&self) -> Candidate {
        let mut candidate = self.record.clone();
        candidate.vote_count = self.vote_count.load(Ordering::SeqCst);
        candidate
    }
}

/// Ballots in arrival order, indexed by voter.
#[derive(Default)]
struct BallotTable {
    rows: Vec<Ballot>,
    by_voter: HashMap<VoterId, usize>,
}

/// An embedded, in-process ledger.
///
/// Each voter and candidate row has its own lock, held by a unit of work from
/// first touch until it ends, so casts for unrelated voters and candidates
/// never wait on each other. Writes are buffered in the unit of work and
/// applied together under the ballot table lock, which is also what
/// [`Ledger::snapshot`] takes to get a consistent view.
///
/// Faults can be injected at any step of a unit of work to exercise rollback.
pub struct MemoryLedger {
    voters: RwLock<HashMap<VoterId, Arc<VoterRow>>>,
    candidates: RwLock<BTreeMap<CandidateId, Arc<CandidateRow>>>,
    ballots: Mutex<BallotTable>,
    faults: Mutex<Vec<(FaultPoint, FaultKind)>>,
    lock_timeout: Duration,
}

impl MemoryLedger {
    /// Create an empty ledger. Units of work give up waiting for a row lock
    /// after `lock_timeout`, with a transient error.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            voters: RwLock::new(HashMap::new()),
            candidates: RwLock::new(BTreeMap::new()),
            ballots: Mutex::new(BallotTable::default()),
            faults: Mutex::new(Vec::new()),
            lock_timeout,
        }
    }

    /// Register a voter. IDs, usernames and emails must be unique.
    pub async fn add_voter(&self, voter: Voter) -> Result<()> {
        let mut voters = self.voters.write().await;
        let clash = voters.contains_key(&voter.id)
            || voters.values().any(|row| {
                row.record.username == voter.username || row.record.email == voter.email
            });
        if clash {
            return Err(Error::FatalStorage(format!(
                "Voter {} clashes with an existing voter",
                voter.id
            )));
        }
        let row = VoterRow {
            has_voted: AtomicBool::new(voter.has_voted),
            record: voter,
            lock: Arc::new(Mutex::new(())),
        };
        voters.insert(row.record.id, Arc::new(row));
        Ok(())
    }

    /// Register a candidate. IDs must be unique.
    pub async fn add_candidate(&self, candidate: Candidate) -> Result<()> {
        let mut candidates = self.candidates.write().await;
        if candidates.contains_key(&candidate.id) {
            return Err(Error::FatalStorage(format!(
                "Candidate {} already exists",
                candidate.id
            )));
        }
        let row = CandidateRow {
            vote_count: AtomicU64::new(candidate.vote_count),
            record: candidate,
            lock: Arc::new(Mutex::new(())),
        };
        candidates.insert(row.record.id, Arc::new(row));
        Ok(())
    }

    /// Make the next unit of work to reach `point` fail there.
    /// Each injected fault fires once.
    pub async fn inject_fault(&self, point: FaultPoint, kind: FaultKind) {
        self.faults.lock().await.push((point, kind));
    }

    async fn take_fault(&self, point: FaultPoint) -> Option<FaultKind> {
        let mut faults = self.faults.lock().await;
        let index = faults.iter().position(|(p, _)| *p == point)?;
        Some(faults.remove(index).1)
    }

    async fn trip(&self, point: FaultPoint) -> Result<()> {
        match self.take_fault(point).await {
            Some(kind) => Err(kind.into_error(point)),
            None => Ok(()),
        }
    }

    async fn acquire(&self, lock: &Arc<Mutex<()>>, row: String) -> Result<OwnedMutexGuard<()>> {
        timeout(self.lock_timeout, lock.clone().lock_owned())
            .await
            .map_err(|_| Error::TransientStorage(format!("Timed out waiting to lock {row}")))
    }

    async fn voter_row(&self, id: VoterId) -> Option<Arc<VoterRow>> {
        self.voters.read().await.get(&id).cloned()
    }

    async fn candidate_row(&self, id: CandidateId) -> Option<Arc<CandidateRow>> {
        self.candidates.read().await.get(&id).cloned()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[rocket::async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>> {
        self.trip(FaultPoint::Begin).await?;
        Ok(Box::new(MemoryUnitOfWork {
            ledger: self,
            voters: HashMap::new(),
            candidates: HashMap::new(),
            pending: Vec::new(),
        }))
    }

    async fn voter(&self, id: VoterId) -> Result<Option<Voter>> {
        Ok(self.voter_row(id).await.map(|row| row.load()))
    }

    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        Ok(self.candidate_row(id).await.map(|row| row.load()))
    }

    async fn tallies(&self, election_id: Option<&str>) -> Result<Vec<Candidate>> {
        let candidates = self.candidates.read().await;
        Ok(candidates
            .values()
            .filter(|row| {
                election_id.is_none() || row.record.election_id.as_deref() == election_id
            })
            .map(|row| row.load())
            .collect())
    }

    async fn ballot_for_voter(&self, id: VoterId) -> Result<Option<Ballot>> {
        let ballots = self.ballots.lock().await;
        Ok(ballots
            .by_voter
            .get(&id)
            .map(|&index| ballots.rows[index].clone()))
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        // Commits apply under the ballot table lock, so holding it freezes
        // every committed effect in place.
        let ballots = self.ballots.lock().await;
        let candidates = self.candidates.read().await;
        let voters = self.voters.read().await;
        Ok(LedgerSnapshot {
            candidates: candidates.values().map(|row| row.load()).collect(),
            ballots: ballots.rows.clone(),
            voted: voters
                .values()
                .filter(|row| row.has_voted.load(Ordering::SeqCst))
                .map(|row| row.record.id)
                .collect::<BTreeSet<_>>(),
        })
    }
}

/// A buffered mutation, applied at commit.
enum Write {
    MarkVoted(Arc<VoterRow>),
    InsertBallot(Ballot),
    Increment(Arc<CandidateRow>),
}

/// A unit of work against a [`MemoryLedger`]. Row locks are released when it
/// is dropped, whether by commit, rollback, or abandonment.
struct MemoryUnitOfWork<'a> {
    ledger: &'a MemoryLedger,
    voters: HashMap<VoterId, (Arc<VoterRow>, OwnedMutexGuard<()>)>,
    candidates: HashMap<CandidateId, (Arc<CandidateRow>, OwnedMutexGuard<()>)>,
    pending: Vec<Write>,
}

impl MemoryUnitOfWork<'_> {
    /// Lock the voter row if we haven't already.
    async fn locked_voter(&mut self, id: VoterId) -> Result<Option<Arc<VoterRow>>> {
        if let Some((row, _)) = self.voters.get(&id) {
            return Ok(Some(row.clone()));
        }
        let Some(row) = self.ledger.voter_row(id).await else {
            return Ok(None);
        };
        let guard = self.ledger.acquire(&row.lock, format!("voter {id}")).await?;
        trace!("Locked voter {id}");
        self.voters.insert(id, (row.clone(), guard));
        Ok(Some(row))
    }

    /// Lock the candidate row if we haven't already.
    async fn locked_candidate(&mut self, id: CandidateId) -> Result<Option<Arc<CandidateRow>>> {
        if let Some((row, _)) = self.candidates.get(&id) {
            return Ok(Some(row.clone()));
        }
        let Some(row) = self.ledger.candidate_row(id).await else {
            return Ok(None);
        };
        let guard = self
            .ledger
            .acquire(&row.lock, format!("candidate {id}"))
            .await?;
        trace!("Locked candidate {id}");
        self.candidates.insert(id, (row.clone(), guard));
        Ok(Some(row))
    }

    fn marked_pending(&self, id: VoterId) -> bool {
        self.pending
            .iter()
            .any(|write| matches!(write, Write::MarkVoted(row) if row.record.id == id))
    }
}

#[rocket::async_trait]
impl<'a> UnitOfWork for MemoryUnitOfWork<'a> {
    async fn lock_voter(&mut self, id: VoterId) -> Result<Option<Voter>> {
        self.ledger.trip(FaultPoint::LockVoter).await?;
        let Some(row) = self.locked_voter(id).await? else {
            return Ok(None);
        };
        let mut voter = row.load();
        voter.has_voted |= self.marked_pending(id);
        Ok(Some(voter))
    }

    async fn mark_voted(&mut self, id: VoterId) -> Result<bool> {
        self.ledger.trip(FaultPoint::MarkVoted).await?;
        let row = self
            .locked_voter(id)
            .await?
            .ok_or(Error::Rejected(Rejection::VoterNotFound))?;
        if row.has_voted.load(Ordering::SeqCst) || self.marked_pending(id) {
            return Ok(false);
        }
        self.pending.push(Write::MarkVoted(row));
        Ok(true)
    }

    async fn insert_ballot(&mut self, ballot: &Ballot) -> Result<()> {
        self.ledger.trip(FaultPoint::InsertBallot).await?;
        let duplicate = self
            .pending
            .iter()
            .any(|write| matches!(write, Write::InsertBallot(b) if b.voter_id == ballot.voter_id));
        if duplicate {
            return Err(Error::Rejected(Rejection::AlreadyVoted));
        }
        self.pending.push(Write::InsertBallot(ballot.clone()));
        Ok(())
    }

    async fn increment_vote_count(&mut self, id: CandidateId) -> Result<bool> {
        self.ledger.trip(FaultPoint::IncrementVoteCount).await?;
        let Some(row) = self.locked_candidate(id).await? else {
            return Ok(false);
        };
        self.pending.push(Write::Increment(row));
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        // Row locks stay held until every write has been applied.
        let MemoryUnitOfWork {
            ledger,
            voters: _voter_locks,
            candidates: _candidate_locks,
            pending,
        } = *self;
        let lost_ack = match ledger.take_fault(FaultPoint::Commit).await {
            Some(FaultKind::LostAck) => true,
            Some(kind) => return Err(kind.into_error(FaultPoint::Commit)),
            None => false,
        };
        let mut ballots = ledger.ballots.lock().await;

        // Check constraints before touching anything.
        for write in &pending {
            if let Write::InsertBallot(ballot) = write {
                if ballots.by_voter.contains_key(&ballot.voter_id) {
                    return Err(Error::Rejected(Rejection::AlreadyVoted));
                }
            }
        }

        for write in pending {
            match write {
                Write::MarkVoted(row) => row.has_voted.store(true, Ordering::SeqCst),
                Write::InsertBallot(ballot) => {
                    let index = ballots.rows.len();
                    ballots.by_voter.insert(ballot.voter_id, index);
                    ballots.rows.push(ballot);
                }
                Write::Increment(row) => {
                    row.vote_count.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        if lost_ack {
            return Err(FaultKind::LostAck.into_error(FaultPoint::Commit));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        trace!(
            "Discarding {} buffered writes and {} row locks",
            self.pending.len(),
            self.voters.len() + self.candidates.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    async fn ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new(Duration::from_millis(100));
        ledger.add_voter(Voter::example(1)).await.unwrap();
        ledger.add_voter(Voter::example(2)).await.unwrap();
        ledger
            .add_candidate(Candidate::example(10, "Alice"))
            .await
            .unwrap();
        ledger
    }

    #[rocket::async_test]
    async fn rejects_duplicate_registrations() {
        let ledger = ledger().await;
        assert!(ledger.add_voter(Voter::example(1)).await.is_err());
        let mut same_handle = Voter::example(3);
        same_handle.username = "voter1".to_string();
        assert!(ledger.add_voter(same_handle).await.is_err());
        assert!(ledger
            .add_candidate(Candidate::example(10, "Bob"))
            .await
            .is_err());
    }

    #[rocket::async_test]
    async fn nothing_is_visible_before_commit() {
        let ledger = ledger().await;
        let mut work = ledger.begin().await.unwrap();
        assert!(work.mark_voted(1).await.unwrap());
        work.insert_ballot(&Ballot::new(1, 10, Utc::now()))
            .await
            .unwrap();
        assert!(work.increment_vote_count(10).await.unwrap());

        assert!(!ledger.voter(1).await.unwrap().unwrap().has_voted);
        assert_eq!(ledger.candidate(10).await.unwrap().unwrap().vote_count, 0);
        assert!(ledger.ballot_for_voter(1).await.unwrap().is_none());

        work.commit().await.unwrap();
        assert!(ledger.voter(1).await.unwrap().unwrap().has_voted);
        assert_eq!(ledger.candidate(10).await.unwrap().unwrap().vote_count, 1);
        assert!(ledger.ballot_for_voter(1).await.unwrap().is_some());
    }

    #[rocket::async_test]
    async fn rollback_discards_everything() {
        let ledger = ledger().await;
        let mut work = ledger.begin().await.unwrap();
        assert!(work.mark_voted(1).await.unwrap());
        work.insert_ballot(&Ballot::new(1, 10, Utc::now()))
            .await
            .unwrap();
        assert!(work.increment_vote_count(10).await.unwrap());
        work.rollback().await.unwrap();

        let snapshot = ledger.snapshot().await.unwrap();
        assert!(snapshot.voted.is_empty());
        assert!(snapshot.ballots.is_empty());
        assert_eq!(snapshot.candidates[0].vote_count, 0);
    }

    #[rocket::async_test]
    async fn mark_voted_is_one_shot() {
        let ledger = ledger().await;
        let mut work = ledger.begin().await.unwrap();
        assert!(work.mark_voted(2).await.unwrap());
        assert!(!work.mark_voted(2).await.unwrap());
        assert!(work.lock_voter(2).await.unwrap().unwrap().has_voted);
        assert!(matches!(
            work.mark_voted(99).await,
            Err(Error::Rejected(Rejection::VoterNotFound))
        ));
    }

    #[rocket::async_test]
    async fn missing_candidate_is_reported() {
        let ledger = ledger().await;
        let mut work = ledger.begin().await.unwrap();
        assert!(!work.increment_vote_count(404).await.unwrap());
    }

    #[rocket::async_test]
    async fn voter_lock_times_out() {
        let ledger = ledger().await;
        let mut first = ledger.begin().await.unwrap();
        first.lock_voter(1).await.unwrap();

        let mut second = ledger.begin().await.unwrap();
        let result = second.lock_voter(1).await;
        assert!(matches!(result, Err(Error::TransientStorage(_))));

        // Unrelated rows are not blocked.
        assert!(second.lock_voter(2).await.unwrap().is_some());
        assert!(second.increment_vote_count(10).await.unwrap());
    }

    #[rocket::async_test]
    async fn faults_fire_once() {
        let ledger = ledger().await;
        ledger
            .inject_fault(FaultPoint::Commit, FaultKind::Fatal)
            .await;

        let work = ledger.begin().await.unwrap();
        assert!(matches!(work.commit().await, Err(Error::FatalStorage(_))));

        let work = ledger.begin().await.unwrap();
        assert!(work.commit().await.is_ok());
    }

    #[rocket::async_test]
    async fn lost_ack_still_commits() {
        let ledger = ledger().await;
        ledger
            .inject_fault(FaultPoint::Commit, FaultKind::LostAck)
            .await;

        let mut work = ledger.begin().await.unwrap();
        assert!(work.mark_voted(1).await.unwrap());
        work.insert_ballot(&Ballot::new(1, 10, Utc::now()))
            .await
            .unwrap();
        assert!(work.increment_vote_count(10).await.unwrap());
        assert!(matches!(
            work.commit().await,
            Err(Error::TransientStorage(_))
        ));

        assert!(ledger.voter(1).await.unwrap().unwrap().has_voted);
        assert!(ledger.ballot_for_voter(1).await.unwrap().is_some());
        assert_eq!(ledger.candidate(10).await.unwrap().unwrap().vote_count, 1);
    }

    #[rocket::async_test]
    async fn second_ballot_for_voter_is_refused_at_commit() {
        let ledger = ledger().await;
        let mut work = ledger.begin().await.unwrap();
        work.insert_ballot(&Ballot::new(1, 10, Utc::now()))
            .await
            .unwrap();
        work.commit().await.unwrap();

        // Bypass the voter flag to hit the ballot constraint directly.
        let mut work = ledger.begin().await.unwrap();
        work.insert_ballot(&Ballot::new(1, 10, Utc::now()))
            .await
            .unwrap();
        assert!(work.increment_vote_count(10).await.unwrap());
        assert!(matches!(
            work.commit().await,
            Err(Error::Rejected(Rejection::AlreadyVoted))
        ));
        assert_eq!(ledger.candidate(10).await.unwrap().unwrap().vote_count, 0);
        assert_eq!(ledger.snapshot().await.unwrap().ballots.len(), 1);
    }
}
