//! HTTP error surface shared by every handler.

pub mod error;
pub mod problem;
