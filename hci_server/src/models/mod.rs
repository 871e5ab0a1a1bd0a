//! TinyHCI data models: builds, runs, and board descriptors.

pub mod board;
pub mod build;
