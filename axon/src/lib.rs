//! Schema-driven decoding of binary content formats, plus the dependency
//! validation plumbing a content pipeline uses to detect stale artifacts.
//!
//! The crate has two halves:
//!
//! - [`schema`], [`expr`], [`lex`] and [`format`] parse a declarative
//!   binary-layout schema and interpret raw byte buffers against it. The
//!   [`format::BinaryFormatter`] walks a buffer as a stream of keyed
//!   value/block/array events; [`format::BinaryBlockMatch`] parses one block
//!   eagerly into a navigable tree.
//! - [`depval`] is a process-wide, free-threaded graph tying runtime
//!   artifacts to the files and upstream artifacts they were built from.
//!   When an input changes, every transitive dependent's validation index
//!   is bumped, which clients compare against an earlier snapshot to decide
//!   whether to rebuild.

pub mod depval;
pub mod expr;
pub mod format;
pub mod lex;
pub mod schema;
pub mod search;
mod utilities;

pub use utilities::{hash_file_path, hash_name};
