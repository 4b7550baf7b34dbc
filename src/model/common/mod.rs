/// Voter IDs are integers, assigned by registration.
pub type VoterId = u32;
/// Candidate IDs are integers, assigned by election management. They also
/// reflect the order in which candidates were created.
pub type CandidateId = u32;
