//! CLI commands

pub mod dump;
pub mod start;
