use thiserror::Error;

/// Why a candidate layout was rejected. Rejections are retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("candidate has no rooms")]
    Empty,

    #[error("room {room_id} lies outside the layout bounds")]
    OutOfBounds { room_id: u32 },

    #[error("{unreachable} room(s) are unreachable from the entry")]
    Disconnected { unreachable: usize },

    #[error("rooms {first} and {second} overlap")]
    Overlapping { first: u32, second: u32 },

    #[error("only {placed} room(s) placed for a target of {target}")]
    TooSparse { placed: usize, target: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("layout generation exhausted after {attempts} attempts: {last_rejection}")]
    Exhausted {
        attempts: u32,
        last_rejection: RejectionReason,
    },

    #[error("invalid generation parameters: {0}")]
    InvalidParameters(String),

    #[error("generation worker failed: {0}")]
    WorkerFailed(String),
}
