pub mod entities;
pub mod ports;
pub mod repositories;
mod sqlx_impls;

pub use entities::*;
pub use obshell_errors::{ObshellError, ObshellResult};
pub use ports::*;
pub use repositories::*;
