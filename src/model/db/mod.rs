pub mod ballot;
pub mod candidate;
pub mod voter;

pub use ballot::{Ballot, BallotCore};
pub use candidate::{Candidate, CandidateCore};
pub use voter::{Voter, VoterCore};
