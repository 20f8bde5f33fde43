pub mod analytics;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod service;
pub mod storage;
