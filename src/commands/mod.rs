//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `package` - Build a launcher package
//! - `deps` - Print the resolved dependency graph
//! - `inspect` - Print what the ELF parser sees in one file
//! - `show` - Display configuration or a package's manifest
//! - `preflight` - Run preflight checks

mod deps;
mod inspect;
mod package;
mod preflight;
pub mod show;
pub mod target;

pub use deps::cmd_deps;
pub use inspect::cmd_inspect;
pub use package::cmd_package;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
