#![cfg_attr(not(test), forbid(unsafe_code))]

//! `ChatGate` server library: admission control, history caching and the
//! streamed chat relay, exposed over HTTP.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
mod tracer;
