//! Core data models for the migration control plane.
//!
//! Plans, jobs and policies are persisted by the metadata store; connectors
//! and filters are value objects embedded in plans; `RunJobRequest` is the
//! queue message workers consume.

pub mod connector;
pub mod job;
pub mod message;
pub mod object;
pub mod plan;
pub mod policy;
