//! Ignition: a content-addressed registry and execution engine for
//! WebAssembly functions, driven over a Unix-domain control socket.
//!
//! The crate is organized around the pipeline a function travels through:
//! build (`builder`) pushes a compiled module into the registry
//! (`store`, `registry`); the control server (`server`) loads it into the
//! instance cache (`cache`), which runs calls through the Wasm runtime
//! (`runtime`) via the invoker (`invoker`) and captures output into a
//! per-function log ring (`logs`). `client` is the corresponding library
//! for driving the control server from another process.

pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod invoker;
pub mod logs;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod store;
