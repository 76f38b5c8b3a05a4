//! Shared utilities across boardfs modules.

pub mod files;

pub use files::{copy_tree, remove_if_exists, write_file_mode, write_file_with_dirs};
