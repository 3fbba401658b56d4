//! Stable exit codes for the `codemod-runner` and `case-inspect` CLIs.

/// Every file was processed without errors.
pub const OK: i32 = 0;
/// The run could not start: bad arguments, config, target or worker pool.
pub const INVALID: i32 = 1;
/// The run finished, but some jobs failed, could not be recorded or applied, or were abandoned.
pub const PARTIAL: i32 = 2;
/// A case log failed verification.
pub const CORRUPT: i32 = 3;
