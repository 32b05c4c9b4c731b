//! Policy-driven object migration between storage backends.
//!
//! The scheduler side (`PlanService`, `TriggerManager`, `Dispatcher`) turns
//! plans into jobs and publishes them; the worker side (`Worker`, `Mover`)
//! consumes them and moves bytes through `StorageAdapter`s.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testkit;
