//! # rkv-server
//!
//! The TCP front door: accepts RESP2 connections and wires them to either a
//! standalone `DataEngine` or a `ClusterRouter`, tracks request metrics, and
//! owns the AOF/expirer background workers for the process.

pub mod metrics;
pub mod server;
