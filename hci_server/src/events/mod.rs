//! Coordinator events.
//!
//! Ingress decodes provider-specific payloads into these; the coordinator
//! never sees provider schema.

pub mod build;
