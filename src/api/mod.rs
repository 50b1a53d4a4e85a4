//! HTTP API: one service per resource kind plus credential management.

pub mod dto;
pub mod handlers;
mod server;

pub use server::{router, serve_tcp, serve_uds};
