//! Protocol adapters for the infrastructure around the services under test

pub mod database;
pub mod mailbox;
pub mod queue;
pub mod storage;

pub use database::Database;
pub use mailbox::{EmailMessage, Mailbox, Pop3Mailbox};
pub use queue::{MessageQueue, QueueMessage, SqsQueue};
pub use storage::{ObjectStorage, S3Storage};
