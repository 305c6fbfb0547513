pub mod api;
pub mod auth;
pub mod commands;
pub mod database;
pub mod stats;
