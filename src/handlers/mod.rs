pub mod health_handlers;
pub mod job_handlers;
pub mod plan_handlers;
pub mod policy_handlers;
