//! Shared domain types for the profile ingest path.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod labels;
mod model;
mod session;
mod tenant;

pub use labels::*;
pub use model::*;
pub use session::*;
pub use tenant::*;

/// The label naming the profile type, e.g. `process_cpu`.
pub const LABEL_NAME_PROFILE: &str = "__name__";

/// The label naming the service a series belongs to.
pub const LABEL_NAME_SERVICE: &str = "service_name";

/// The value injected for series that carry no [`LABEL_NAME_SERVICE`] label.
pub const SERVICE_NAME_UNSPECIFIED: &str = "unspecified";

/// The per-sample label carrying a session identifier.
pub const LABEL_NAME_SESSION: &str = "session_id";

/// The historical name of the span id sample label, consolidated into
/// [`LABEL_NAME_SPAN`] at ingest time.
pub const LABEL_NAME_PROFILE_ID: &str = "profile_id";

/// The per-sample label linking a sample to a tracing span.
pub const LABEL_NAME_SPAN: &str = "span_id";
