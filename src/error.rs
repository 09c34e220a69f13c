//! Main Crate Error

use crate::common::Id;

#[derive(thiserror::Error, Debug)]
/// Quorum DHT crate error enum.
pub enum Error {
    /// Id bytes are not exactly [crate::common::ID_SIZE] long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string is not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Indicates that the request you're trying to build requires more information.
    #[error("{0} is required")]
    BuilderMissingFieldError(&'static str),

    /// Indicates that the builder is in an invalid/ambiguous state to build the desired
    /// request.
    #[error("Builder state invalid: {0}")]
    BuilderInvalidComboError(&'static str),

    /// The routing layer could not find candidates for a target.
    #[error("Routing to {target} failed: {reason}")]
    Routing { target: Id, reason: String },

    /// The [crate::Dht] was dropped or its executor is gone.
    #[error("The Dht was shutdown")]
    DhtWasShutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// A single request to a single peer failed.
///
/// These are absorbed by the quorum engine, which draws a replacement peer
/// as long as the failure budget allows.
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Peer is unreachable")]
    Unreachable,

    #[error("Request was cancelled")]
    Cancelled,

    /// The peer answered, but refused the request.
    #[error("Peer rejected the request: {0}")]
    Rejected(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Evaluating per-peer results into one logical result failed.
pub enum EvaluationError {
    /// The scheme can't reduce this kind of result, e.g. cumulating opaque values.
    #[error("{scheme} evaluation does not support {result}")]
    Unsupported {
        scheme: &'static str,
        result: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
