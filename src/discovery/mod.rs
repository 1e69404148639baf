//! Algorithm file discovery.
//!
//! Uses the `ignore` crate so a `.gitignore` in the algorithms directory is
//! honoured, then applies the configured exclude globs.

mod files;

pub use files::find_algorithm_files;
