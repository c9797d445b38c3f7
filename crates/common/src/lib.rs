//! Ambient runtime plumbing shared by every hearth crate: logging setup for
//! binaries, and the signal gate which defers termination signals around
//! critical sections.

pub mod logging;
pub mod signal;
