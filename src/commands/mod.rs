//! Command implementations
//!
//! Each module corresponds to a subcommand in the CLI.

pub mod ingest;
pub mod manage;
pub mod query;

pub use ingest::{collect_files, run as ingest_run, IngestArgs};
pub use manage::{clients as clients_run, reset as reset_run, stats as stats_run};
pub use query::{run as query_run, OutputFormat, QueryArgs};
