#![cfg_attr(not(test), forbid(unsafe_code))]

//! Parley server: the WebSocket connection hub, the conversation store with
//! its read-through cache, and the REST surface over both.

pub mod app_state;
pub mod cache;
pub mod db;
pub mod fabric;
pub mod handlers;
pub mod http;
pub mod hub;
pub mod middleware;
pub mod responder;
pub mod routes;
pub mod server;
pub mod store;
pub mod tracer;
