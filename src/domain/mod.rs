//! Domain layer - Core pipeline types with no I/O dependencies.

/// Message schema for the exchange feed.
pub mod message;

/// Per-symbol sequence continuity tracking.
pub mod sequence;
