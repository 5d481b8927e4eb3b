//! # camrelay-common
//!
//! Configuration and error types shared by the camrelay API and server crates.
//! The relay engine itself never reads configuration; the server translates
//! it into plain option structs before constructing endpoints.

pub mod config;
pub mod error;
pub mod validation;
