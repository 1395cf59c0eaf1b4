pub mod config;
pub mod db;
pub mod model;
pub mod outbox;
pub mod processor;
pub mod scheduler;
pub mod segment;
pub mod steps;
pub mod templates;
pub mod transport;
pub mod worker;
