//! This crate exists to coordinate versions of `tracing` used by the
//! workspace. Crates should use `observability_deps::tracing` rather than
//! depending on `tracing` directly, so the subscriber and macro versions
//! always agree.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
