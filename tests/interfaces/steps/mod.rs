//! Cucumber step definitions for interface tests.

pub mod channel_layer;
