pub mod db;
pub mod models;
pub mod service;

pub use db::{HistoryStore, PersistenceError};
pub use models::{Role, Transcript, Turn};
pub use service::{QueryService, QueryState, REPLY_ROLE};
