//! Filesystem-backed execution snapshots.
//!
//! One `<execution_id>.json` per execution in a configurable directory.
//! Writes go through a temp sibling, fsync, and rename so a crash never
//! leaves a half-written snapshot behind.

mod file;

pub use file::FileStateStore;
