// TODO
// - stream the per-VM data pass across logical files concurrently instead
//   of joining each handler thread before starting the next
// - archive inspection subcommand that runs only the header/catalog pass

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod header;
pub mod orchestrator;
pub mod outer_extractor;
pub mod plan;
pub mod source;
pub mod vmhost;

pub use config::Config;
pub use error::{RestoreError, Result};
pub use orchestrator::{Orchestrator, RestoreSummary};
pub use vmhost::{NullVmHost, VmHandle, VmHost};
