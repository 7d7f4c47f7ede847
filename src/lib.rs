//! Synchronization and task-execution core for a Gmail-flavored IMAP backend.
//!
//! The crate has two halves: a generic durable task pipeline (task/marker
//! lifecycle, exclusive-resource serialization, priority scheduling, atomic
//! plan/execute/commit) and the concrete incremental-sync tasks that drive
//! Gmail reconciliation on top of it. Wire-protocol parsing, the client
//! object model, and conversation summarization are external collaborators
//! reached through the traits in [`transport`] and [`churn`].

pub mod churn;
pub mod config;
pub mod errors;
pub mod storage;
pub mod sync;
pub mod task;
pub mod transport;
pub mod types;

pub use churn::{BasicChurn, ConversationChurn};
pub use config::SyncDefaults;
pub use errors::TaskError;
pub use storage::Database;
pub use task::manager::TaskManager;
pub use task::{ConvWork, TaskSpec};
pub use transport::{MailTransport, MockTransport};
