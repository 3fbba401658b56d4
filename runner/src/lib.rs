//! Batch codemod runner.
//!
//! Runs one transformation over many files on a pool of isolated workers and
//! keeps a tamper-evident, replayable case log of every resulting mutation.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (pool bookkeeping, job protocol,
//!   case log codec, source normalization). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (sandbox, workers, filesystem,
//!   case log files, child processes). Isolated to enable test doubles.
//!
//! Orchestration modules ([`scheduler`], [`recorder`], [`run`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod recorder;
pub mod run;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
