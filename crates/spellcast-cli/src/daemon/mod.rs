//! Daemon hosting the casting engine, and the client that talks to it.

pub mod client;
pub mod paths;
pub mod server;

pub use client::DaemonClient;
pub use server::DaemonServer;
