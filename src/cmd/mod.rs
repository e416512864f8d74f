//! CLI command implementations.
//!
//! | Module   | Modes handled           |
//! |----------|-------------------------|
//! | `run`    | `full`, `rework-only`   |
//! | `status` | `status`                |

pub mod run;
pub mod status;

pub use run::cmd_run;
pub use status::cmd_status;
