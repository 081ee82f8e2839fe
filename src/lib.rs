//! remotefs: expose an object store as a directory tree, over FUSE or as a
//! read-only HTTP index.

pub mod cadapter;
pub mod cli;
pub mod config;
pub mod fuse;
pub mod logging;
pub mod serve;
pub mod vfs;
