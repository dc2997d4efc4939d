//! # scanhive-api
//!
//! The public operations surface of scanhive: a thin, typed layer over the
//! shared core that fixes the external contract — submit, status, listing,
//! cancellation, projected results, pool/queue introspection, and DLQ
//! administration. Transport wiring (RPC, HTTP, tool adapters) lives with
//! the embedding service; everything here is plain async methods on
//! [`ops::ScanService`].

pub mod ops;

pub use ops::ScanService;
