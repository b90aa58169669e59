pub mod app;
pub mod audit;
pub mod config;
pub mod execution;
pub mod gates;
pub mod learning;
pub mod recovery;
pub mod risk;
pub mod rollback;
pub mod runtime;
pub mod shared;
pub mod sla;
pub mod task;
