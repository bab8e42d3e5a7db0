pub mod auditor;
pub mod controller;
pub mod database;
pub mod gate;
pub mod ledger;
pub mod markers;
pub mod metrics;
pub mod prompt;
pub mod providers;
pub mod search;
pub mod stores;
pub mod tier;
pub mod tools;

pub use controller::{ChatPipeline, ChatStream, Collaborators};
pub use database::ChatDb;
pub use metrics::{get_metrics, init_metrics};
