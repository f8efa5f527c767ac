//! Postgres connection and schema bootstrap.

pub mod bootstrap;
