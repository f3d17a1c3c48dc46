//! Logging facade for the Cascade runtime.
//!
//! Re-exports the [`log`] crate's macros so that engine crates depend on a
//! single logging surface. The host decides which backend (if any) consumes
//! the records.

pub use log::{debug, error, info, trace, warn};
