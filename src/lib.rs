//! A JSON document store served over HTTP

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod http;
pub mod metrics;
pub mod server;
pub mod state;
pub mod store;

pub use store::{DocId, Store, StoreError};
