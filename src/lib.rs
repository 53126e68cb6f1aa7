//! Tether fetches a server binary from a release feed, caches it locally, and
//! supervises a single instance of it: it launches the process, detects
//! readiness from its output, stops it gracefully (then forcefully), and
//! registers service deployments with the server's control plane.

/// Binary acquisition: cache reuse or download and install.
pub mod acquire;

/// Release archive extraction.
pub mod archive;

/// Local binary cache with time-based staleness.
pub mod cache;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants shared across modules.
pub mod constants;

/// Readiness-triggered deployment registration.
pub mod deployment;

/// Error handling.
pub mod error;

/// Lifecycle event bus.
pub mod events;

/// Child process output handling.
pub mod logs;

/// Host platform tags.
pub mod platform;

/// Deployment registration with retries.
pub mod registrar;

/// Release feed lookup.
pub mod release;

/// Server process supervision.
pub mod supervisor;

/// Helpers for tests that touch process-wide state.
#[doc(hidden)]
pub mod test_utils;
