//! The in-flight representation of a push request.
//!
//! Wire payloads are decoded into this model at the edge; the pipeline
//! transforms it (normalisation, splitting, re-serialisation) before fan-out
//! re-encodes it per destination.

use std::fmt;

use bytes::Bytes;
use pprof_codec::RawProfile;

use crate::Labels;

/// The source encoding of a pushed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawProfileType {
    #[default]
    Pprof,
    Jfr,
    Otel,
}

impl RawProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pprof => "pprof",
            Self::Jfr => "jfr",
            Self::Otel => "otel",
        }
    }
}

impl fmt::Display for RawProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded push request.
#[derive(Debug, Default)]
pub struct PushRequest {
    pub series: Vec<ProfileSeries>,
    /// Sum of the compressed input payload sizes, in bytes.
    pub raw_profile_size: usize,
    pub raw_profile_type: RawProfileType,
}

/// A labelled sequence of profile samples.
#[derive(Debug, Default)]
pub struct ProfileSeries {
    pub labels: Labels,
    pub samples: Vec<ProfileSample>,
}

/// A single profile payload within a series.
///
/// The decoded profile and its wire payload travel together; both drop when
/// the request's last reference to the sample does, on every exit path.
#[derive(Debug)]
pub struct ProfileSample {
    /// The decoded profile.
    pub profile: RawProfile,
    /// The wire payload (gzip-compressed pprof).
    pub raw_profile: Bytes,
    /// Unique sample id, assigned by the distributor before fan-out.
    pub id: String,
}
