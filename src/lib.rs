//! Two-tier render cache with self-healing cache-context redirection.

pub mod cache;
pub mod config;
pub mod infra;
pub mod replay;
