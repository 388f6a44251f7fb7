//! Garrison per-pool worker library: directive/command handling, the
//! server command registry, per-server handles with console tails, usage
//! sampling and the directory-backed supervisor default.

pub mod agent;
pub mod commands;
pub mod disk_supervisor;
pub mod handle;
pub mod usage;
