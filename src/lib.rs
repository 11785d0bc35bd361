pub mod api;
pub mod config;
pub mod error;
pub mod files;
pub mod node;
pub mod notify;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod space;
pub mod store;
pub mod worker;
