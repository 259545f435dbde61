use thiserror::Error;

/// Error taxonomy for the consensus module itself. Peer-transport and
/// higher-level domain errors live in the `chorus` crate; this is
/// intentionally narrow.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    #[error("this node is not part of the current membership")]
    NotAMember,
}
