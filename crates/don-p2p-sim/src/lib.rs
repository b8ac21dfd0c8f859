//! # don-p2p-sim
//!
//! Brings up a set of named nodes on an in-memory network, applies DON pair
//! updates, replays traffic and reports every node's link health.
//!
//! Node keys are derived from node names, so a scenario always produces the
//! same peer ids.
//!
//! ## Scenario format
//!
//! ```json
//! {
//!   "nodes": ["boot", "a1", "b1"],
//!   "bootstrappers": ["boot"],
//!   "dons": [{"id": 1, "members": ["a1"]}, {"id": 2, "members": ["b1"]}],
//!   "pairs": [[1, 2]],
//!   "messages": [{"from": "a1", "to": "b1", "payload": "hi", "repeat": 3}]
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod error;
pub mod report;
pub mod runner;
pub mod scenario;

pub use error::{SimError, SimResult};
pub use report::{LinkSummary, NodeReport, SimReport, TrafficReport};
pub use runner::{SimOptions, run};
pub use scenario::{DonSpec, MessageSpec, Scenario, node_id, node_seed};
