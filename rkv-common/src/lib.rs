//! # rkv-common
//!
//! Shared vocabulary for the workspace: the RESP2 wire value type and its
//! parser/encoder, the crate-wide error type, and the configuration file
//! loader. Everything here is consumed by at least two other crates in the
//! workspace, which is the bar for living in `rkv-common` rather than next
//! to its one caller.

pub mod config;
pub mod error;
pub mod resp;

pub use config::Config;
pub use error::{ArityKind, RkvError, RkvResult};
pub use resp::{encode_command, read_reply, RequestParser, RespValue};
