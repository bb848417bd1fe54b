//! Experiment and model storage for a simulation platform.
//!
//! Two interchangeable [`services::Storage`] backends (a local directory tree
//! with a SQLite metadata store, and a remote bucket reached over HTTPS) sit
//! behind the [`handlers::RequestHandler`] façade.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;
