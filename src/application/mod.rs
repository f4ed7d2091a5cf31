//! Application layer - Port definitions for external collaborators.

/// Interfaces implemented by infrastructure adapters.
pub mod ports;
