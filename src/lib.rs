//! file-server - a small networked blob repository
//!
//! Clients upload, fetch, and delete named blobs over a persistent TCP
//! connection. This crate provides:
//! - A thread-safe name <-> id index with monotonic, never-reused ids
//! - A storage engine keeping the index and the blob directory consistent
//! - A framed wire protocol with explicit request ids
//! - A per-connection dispatcher running operations concurrently

pub mod client;
pub mod config;
pub mod object_store;
pub mod protocol;
pub mod server;
pub mod storage;
#[cfg(test)]
pub mod testutil;
