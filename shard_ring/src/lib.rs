//! Consistent-hash ring primitives for the ingest path.
//!
//! Two rings live here:
//!
//! - The **ingester ring** ([`HashRing`], consumed through [`ReadRing`]):
//!   read-only from the distributor's point of view, it maps series tokens
//!   to replication sets of ingester instances, optionally scoped to a
//!   tenant's shuffle shard.
//! - The **distributor ring** ([`Lifecycler`]): each distributor registers
//!   itself in a CAS-capable KV store so peers can count healthy instances
//!   and divide global rate limits between them.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod desc;
mod kv;
mod lifecycler;
mod replication;
mod ring;
mod token;

pub use desc::*;
pub use kv::*;
pub use lifecycler::*;
pub use replication::*;
pub use ring::*;
pub use token::*;

use thiserror::Error;

/// Errors selecting instances from a ring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The ring contains no instances at all.
    #[error("empty ring")]
    Empty,

    /// Not enough healthy instances to satisfy the write quorum.
    #[error("too many unhealthy instances in the ring ({healthy} healthy, {required} required)")]
    TooManyUnhealthy { healthy: usize, required: usize },
}
