//! Reverse-proxy dispatch helpers (C6).
//!
//! Everything route-matching and plugin-chain related lives in `crate::core`; this module
//! is only the piece that turns a matched route into an upstream call - building the
//! `HttpPeer`, rewriting the outbound request, and deciding whether a failed connection
//! attempt is worth retrying.

pub mod upstream;
