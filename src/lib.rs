#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod error;
pub mod matchmaking;
pub mod transport;
pub mod user;

pub use config::MatchmakingConfig;
pub use error::{SearchError, TransportError};
pub use matchmaking::{MatchRequest, MatchResult, Matchmaker, OnlinePlayMode, ProcessState};
pub use transport::UdpTransport;
pub use user::{CredentialProvider, Identity, StaticCredentials, UserProfile};
