//! Accord acceptance-test engine
//!
//! Drives black-box acceptance tests against running HTTP services:
//! - Waits for every registered application to answer on both ports
//! - Parses declarative YAML features with typed steps or plain phrases
//! - Dispatches requests with permanent and one-time header sets
//! - Asserts on JSON responses, retrying eventually-consistent checks
//! - Fans table rows out concurrently with isolated per-row state
//! - Drives queue, object storage, mailbox and SQL fixtures
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TestRunner                              │
//! │    ├── start() -> wait for AppRegistry readiness            │
//! │    ├── run_scenario(feature, scenario) -> TestResult        │
//! │    └── write_results(suite) -> test-results.json            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session (shared)              Worker (per flow / row)      │
//! │    ├── Context ${NAME}           ├── one-time headers       │
//! │    ├── permanent headers         └── last response          │
//! │    ├── HttpDispatcher + RequestLog                          │
//! │    └── fixtures: queue, storage, mailbox, databases         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  steps::execute(session, worker, step)                      │
//! │    ├── json: path / compare / sort                          │
//! │    ├── poll: bounded retry, queue drain                     │
//! │    └── table: process_rows (buffer_unordered)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fixtures;
pub mod http;
pub mod json;
pub mod phrase;
pub mod poll;
pub mod registry;
pub mod runner;
pub mod session;
pub mod spec;
pub mod steps;
pub mod table;

pub use config::SuiteConfig;
pub use context::{Context, Worker};
pub use error::{AccordError, AccordResult, ErrorKind};
pub use http::{DispatchRequest, HttpDispatcher, Method, Response};
pub use registry::{AppRegistry, ApplicationInfo};
pub use runner::{TestResult, TestRunner, TestSuiteResult};
pub use session::Session;
pub use spec::{Feature, Scenario, Step, StepEntry};
pub use table::{process_rows, DataTable, TableRow};
