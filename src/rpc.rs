//! Quorum requests: asking enough peers, tolerating failures, and evaluating their answers.

mod engine;
pub mod evaluation;
pub mod future;
mod operations;
mod policy;
pub mod server;
mod transport;

pub use engine::{Aggregator, EngineSummary, QuorumRequestEngine, QuorumState, Step};
pub use evaluation::{CumulativeScheme, EvaluationScheme, VotingScheme};
pub use future::{Cancellation, FutureStatus, RawResults, ResultFuture};
pub use operations::{DataMap, DigestFuture, GetFuture, Outcomes, PutFuture, RemoveFuture};
pub use policy::{
    RequestPolicy, DEFAULT_MAX_FAILURES, DEFAULT_MINIMUM_RESULTS, DEFAULT_PARALLEL_DIFF,
};
pub use server::{RequestFilter, StorageServer, StorageServerSettings};
pub use transport::{ChannelHandle, ConnectionPool, Routing, RoutingResult, Transport};
