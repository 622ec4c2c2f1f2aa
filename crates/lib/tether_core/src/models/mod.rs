//! Domain models.

pub mod connection;
pub mod integration;
