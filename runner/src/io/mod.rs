//! I/O helpers for runner commands.

pub mod apply;
pub mod case_log;
pub mod config;
pub mod discover;
pub mod process;
pub mod report;
pub mod sandbox;
pub mod transformer;
pub mod worker;
