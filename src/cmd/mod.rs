//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `plan`   | `Plan`           |
//! | `run`    | `Run`            |
//! | `config` | `Config`         |

pub mod config;
pub mod plan;
pub mod run;

pub use config::{cmd_config, load_config};
pub use plan::cmd_plan;
pub use run::{RunOptions, cmd_run};
