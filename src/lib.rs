pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker;
