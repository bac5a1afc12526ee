pub mod config;
pub mod constants;
pub mod exit_code;
pub mod logging;

pub use config::*;
pub use obshell_errors::{ObshellError, ObshellResult};
