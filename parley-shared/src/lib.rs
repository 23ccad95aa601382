#![cfg_attr(not(test), forbid(unsafe_code))]
#![warn(clippy::pedantic)]

//! Models, wire frames and configuration shared by the Parley server and its clients.

pub mod config;
pub mod models;
