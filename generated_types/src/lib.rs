//! Wire types for the profile push RPC.
//!
//! The prost/tonic output for `protos/pusher.proto` is checked in rather than
//! generated at build time, so consumers do not need `protoc` available.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod pusher;

pub use pusher::*;
