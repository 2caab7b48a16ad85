pub mod api;
pub mod config;
pub mod error;
pub mod inventory;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod worker;
