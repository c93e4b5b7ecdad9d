//! Background update checker for the platform runtime.
//!
//! Periodically polls the release feed for newer runtime releases, records
//! them in a small SQLite database, and computes the end-of-support style
//! warnings the operator UI displays. At most one process cluster-wide
//! performs a check per interval; mutual exclusion rides entirely on the
//! database transaction that spans each check cycle.

pub mod config;
pub mod update;
