//! CLI subcommands of the `flowserve` binary.
//!
//! ## Usage
//!
//! ```bash
//! flowserve run --graph graph.toml --body '{"n": 1}'   # one event through a graph
//! flowserve config show                              # effective configuration
//! flowserve worker --mode pool                       # subprocess host (spawned by the dispatcher)
//! ```

pub mod config_cmd;
pub mod run_cmd;

pub use config_cmd::{run_defaults, run_show, run_validate};
pub use run_cmd::{parse_run_args, run_graph, RunArgs};

/// Exit code for invalid arguments or configuration.
pub const EXIT_USAGE: i32 = 2;
