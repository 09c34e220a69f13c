#![doc = include_str!("../README.md")]

// Public modules
pub mod common;
mod config;
mod dht;
mod error;
pub mod rpc;
pub mod storage;

pub use crate::common::{CompositeKey, Digest, Entry, Id, MetaUpdate, Peer, PutOutcome};
pub use bytes::Bytes;
pub use config::{Config, DEFAULT_MAX_CONNECTIONS};
pub use dht::{
    AddRequest, Dht, DhtBuilder, DigestRequest, Fault, GetRequest, PutMetaRequest, PutRequest,
    RemoveRequest, Testnet,
};
pub use error::{Error, EvaluationError, Result, TransportError};

pub use ed25519_dalek::{SigningKey, VerifyingKey};
