pub mod calendar;
pub mod compactor;
pub mod config;
pub mod effects;
pub mod engine;
pub mod model;
pub mod moves;
pub mod notify;
pub mod observability;
pub mod service;
pub mod users;
pub mod wal;
