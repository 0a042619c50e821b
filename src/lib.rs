pub mod config;
pub mod cron;
pub mod database;
pub mod dead_letter;
pub mod error;
pub mod executor;
pub mod messaging;
pub mod models;
pub mod routes;
pub mod scheduler;
pub mod wheel;
