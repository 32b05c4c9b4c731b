//! Control plane and data plane services.

pub mod broker;
pub mod dispatcher;
pub mod lock;
pub mod metadata_store;
pub mod mover;
pub mod plan_service;
pub mod trigger;
pub mod worker;
