//! Shared helpers.

pub mod bootstrap;
pub mod retry;
