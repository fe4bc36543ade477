//! Shared filesystem utilities.

pub mod files;
pub mod parallel;
pub mod temp;

pub use files::{write_file_mode, write_file_with_dirs};
pub use parallel::parallel_map;
pub use temp::{cleanup_work_dir, prepare_work_dir};
