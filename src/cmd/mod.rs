//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `plan`   | `Plan`           |
//! | `config` | `Config`         |

pub mod config;
pub mod plan;
pub mod run;

pub use config::cmd_config;
pub use plan::cmd_plan;
pub use run::{RunArgs, cmd_run};
