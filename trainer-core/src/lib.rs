//! Trainer Core - shared domain and protocol types
//!
//! This crate contains the records that describe a Trainer cluster (hosts,
//! applications, pending changes) and the JSON wire types exchanged with the
//! host agent at check-in. It is pure data plus serde; all behavior lives in
//! `trainer-server`.

mod model;
mod protocol;

pub use model::*;
pub use protocol::*;
