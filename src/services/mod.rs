pub mod breaker;
pub mod governor;
pub mod orchestrator;
pub mod processor;
pub mod rate;
pub mod registry;
pub mod remote;
pub mod store;
