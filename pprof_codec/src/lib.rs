//! Decode, transform and re-encode pprof profile payloads.
//!
//! This crate owns the subset of pprof handling the ingest path needs:
//! parsing (optionally gzip-compressed) payloads, normalising the decoded
//! profile, renaming sample labels, grouping samples by their label sets,
//! exporting sample subsets into free-standing profiles, and serialising
//! profiles back into wire payloads.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::io::{Read, Write};

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use prost::Message;
use thiserror::Error;

mod export;
mod group;
pub mod proto;

pub use export::SampleExporter;
pub use group::{group_samples_by_labels, SampleGroup};

/// The 2-byte magic prefix of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors decoding a raw pprof payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload looked gzip-compressed but did not decompress.
    #[error("error decoding gzip stream: {0}")]
    InvalidGzip(std::io::Error),

    /// The (decompressed) payload is not a valid pprof protobuf.
    #[error("malformed pprof payload: {0}")]
    Malformed(#[from] prost::DecodeError),
}

/// Errors serialising a profile back into a wire payload.
#[derive(Debug, Error)]
#[error("error encoding gzip stream: {0}")]
pub struct EncodeError(#[from] std::io::Error);

/// A decoded pprof profile.
///
/// Wraps the raw protobuf message with the operations the ingest path
/// performs on it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawProfile {
    profile: proto::Profile,
}

impl RawProfile {
    /// Decode `payload`, transparently decompressing gzip streams.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let profile = if payload.starts_with(&GZIP_MAGIC) {
            let mut buf = Vec::with_capacity(payload.len() * 2);
            MultiGzDecoder::new(payload)
                .read_to_end(&mut buf)
                .map_err(DecodeError::InvalidGzip)?;
            proto::Profile::decode(buf.as_slice())?
        } else {
            proto::Profile::decode(payload)?
        };
        Ok(Self { profile })
    }

    /// Wrap an already decoded profile.
    pub fn from_proto(profile: proto::Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &proto::Profile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut proto::Profile {
        &mut self.profile
    }

    pub fn into_proto(self) -> proto::Profile {
        self.profile
    }

    /// The decompressed, encoded size of this profile in bytes.
    pub fn size_bytes(&self) -> usize {
        self.profile.encoded_len()
    }

    /// The number of samples recorded in this profile.
    pub fn sample_count(&self) -> usize {
        self.profile.sample.len()
    }

    /// Serialise this profile as a gzip-compressed protobuf into `buf`.
    pub fn write_gzipped(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        let encoded = self.profile.encode_to_vec();
        let mut encoder = GzEncoder::new(buf, Compression::default());
        encoder.write_all(&encoded)?;
        encoder.finish()?;
        Ok(())
    }

    /// Bring the profile into canonical form:
    ///
    /// - the string table is never empty and starts with `""`
    /// - samples whose values are all zero are dropped
    /// - sample labels with an empty key are dropped
    /// - each sample's labels are sorted by (key, str, num, num_unit)
    pub fn normalize(&mut self) {
        let p = &mut self.profile;
        if p.string_table.first().map(|s| !s.is_empty()).unwrap_or(true) {
            p.string_table.insert(0, String::new());
            shift_string_indexes(p);
        }
        p.sample.retain(|s| s.value.iter().any(|&v| v != 0));
        for sample in &mut p.sample {
            sample.label.retain(|l| l.key != 0);
            sample
                .label
                .sort_unstable_by_key(|l| (l.key, l.str, l.num, l.num_unit));
        }
    }
}

/// Rewrite every string table index in `p` after an insertion at index 0.
///
/// Before the insertion index 0 named a real string, so all indexes shift,
/// including zero ones.
fn shift_string_indexes(p: &mut proto::Profile) {
    for t in &mut p.sample_type {
        t.r#type += 1;
        t.unit += 1;
    }
    if let Some(t) = p.period_type.as_mut() {
        t.r#type += 1;
        t.unit += 1;
    }
    for s in &mut p.sample {
        for l in &mut s.label {
            l.key += 1;
            l.str += 1;
            l.num_unit += 1;
        }
    }
    for m in &mut p.mapping {
        m.filename += 1;
        m.build_id += 1;
    }
    for f in &mut p.function {
        f.name += 1;
        f.system_name += 1;
        f.filename += 1;
    }
    for c in &mut p.comment {
        *c += 1;
    }
    p.drop_frames += 1;
    p.keep_frames += 1;
    p.default_sample_type += 1;
}

/// Resolve a string table index, returning `""` for out-of-range indexes.
pub fn string<'a>(p: &'a proto::Profile, index: i64) -> &'a str {
    usize::try_from(index)
        .ok()
        .and_then(|i| p.string_table.get(i))
        .map(|s| s.as_str())
        .unwrap_or("")
}

/// Intern `s` in the profile's string table, returning its index.
pub fn intern(p: &mut proto::Profile, s: &str) -> i64 {
    if let Some(i) = p.string_table.iter().position(|v| v == s) {
        return i as i64;
    }
    p.string_table.push(s.to_owned());
    (p.string_table.len() - 1) as i64
}

/// Rename every sample label keyed `from` to `to`.
///
/// A no-op if no label uses `from`.
pub fn rename_label(p: &mut proto::Profile, from: &str, to: &str) {
    let Some(from_idx) = p.string_table.iter().position(|v| v == from) else {
        return;
    };
    let from_idx = from_idx as i64;
    if !p
        .sample
        .iter()
        .any(|s| s.label.iter().any(|l| l.key == from_idx))
    {
        return;
    }
    let to_idx = intern(p, to);
    for sample in &mut p.sample {
        for label in &mut sample.label {
            if label.key == from_idx {
                label.key = to_idx;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_profile {
    use crate::proto;

    /// A profile with two samples labelled `span_id=a` / `span_id=b` and one
    /// unlabelled sample, sharing one location.
    pub(crate) fn labelled() -> proto::Profile {
        proto::Profile {
            string_table: vec![
                "".into(),
                "cpu".into(),
                "nanoseconds".into(),
                "span_id".into(),
                "a".into(),
                "b".into(),
                "main".into(),
                "main.go".into(),
            ],
            sample_type: vec![proto::ValueType { r#type: 1, unit: 2 }],
            period_type: Some(proto::ValueType { r#type: 1, unit: 2 }),
            period: 10_000_000,
            time_nanos: 1_700_000_000_000_000_000,
            duration_nanos: 15_000_000_000,
            mapping: vec![proto::Mapping {
                id: 1,
                memory_start: 0x1000,
                memory_limit: 0x2000,
                filename: 7,
                ..Default::default()
            }],
            function: vec![proto::Function {
                id: 1,
                name: 6,
                system_name: 6,
                filename: 7,
                ..Default::default()
            }],
            location: vec![proto::Location {
                id: 1,
                mapping_id: 1,
                address: 0x1042,
                line: vec![proto::Line {
                    function_id: 1,
                    line: 42,
                }],
                ..Default::default()
            }],
            sample: vec![
                proto::Sample {
                    location_id: vec![1],
                    value: vec![100],
                    label: vec![proto::Label {
                        key: 3,
                        str: 4,
                        ..Default::default()
                    }],
                },
                proto::Sample {
                    location_id: vec![1],
                    value: vec![200],
                    label: vec![proto::Label {
                        key: 3,
                        str: 5,
                        ..Default::default()
                    }],
                },
                proto::Sample {
                    location_id: vec![1],
                    value: vec![300],
                    label: vec![],
                },
            ],
            ..Default::default()
        }
    }

    /// A profile whose samples carry no labels at all.
    pub(crate) fn unlabelled() -> proto::Profile {
        let mut p = labelled();
        for sample in &mut p.sample {
            sample.label.clear();
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_plain_and_gzipped() {
        let original = test_profile::labelled();
        let plain = original.encode_to_vec();

        let parsed = RawProfile::parse(&plain).unwrap();
        assert_eq!(parsed.profile(), &original);

        let mut gzipped = Vec::new();
        parsed.write_gzipped(&mut gzipped).unwrap();
        assert!(gzipped.starts_with(&GZIP_MAGIC));

        let reparsed = RawProfile::parse(&gzipped).unwrap();
        assert_eq!(reparsed.profile(), &original);
    }

    #[test]
    fn test_parse_malformed() {
        assert_matches!(
            RawProfile::parse(b"definitely not a profile"),
            Err(DecodeError::Malformed(_))
        );

        // A gzip header followed by garbage.
        assert_matches!(
            RawProfile::parse(&[0x1f, 0x8b, 0xff, 0xff]),
            Err(DecodeError::InvalidGzip(_))
        );
    }

    #[test]
    fn test_normalize_drops_zero_samples() {
        let mut p = test_profile::labelled();
        p.sample[1].value = vec![0];
        let mut raw = RawProfile::from_proto(p);
        raw.normalize();
        assert_eq!(raw.sample_count(), 2);
    }

    #[test]
    fn test_normalize_strips_empty_label_keys_and_sorts() {
        let mut p = test_profile::labelled();
        p.sample[0].label = vec![
            proto::Label {
                key: 3,
                str: 5,
                ..Default::default()
            },
            proto::Label {
                key: 0,
                str: 4,
                ..Default::default()
            },
            proto::Label {
                key: 3,
                str: 4,
                ..Default::default()
            },
        ];
        let mut raw = RawProfile::from_proto(p);
        raw.normalize();

        let labels = &raw.profile().sample[0].label;
        assert_eq!(labels.len(), 2);
        assert_eq!((labels[0].key, labels[0].str), (3, 4));
        assert_eq!((labels[1].key, labels[1].str), (3, 5));
    }

    #[test]
    fn test_normalize_fixes_string_table_origin() {
        let mut p = test_profile::labelled();
        // Simulate a producer that omits the leading empty string.
        p.string_table.remove(0);
        for t in &mut p.sample_type {
            t.r#type -= 1;
            t.unit -= 1;
        }
        if let Some(t) = p.period_type.as_mut() {
            t.r#type -= 1;
            t.unit -= 1;
        }
        for s in &mut p.sample {
            for l in &mut s.label {
                l.key -= 1;
                l.str -= 1;
            }
        }
        for m in &mut p.mapping {
            m.filename -= 1;
            m.build_id = 0;
        }
        for f in &mut p.function {
            f.name -= 1;
            f.system_name -= 1;
            f.filename -= 1;
        }

        let mut raw = RawProfile::from_proto(p);
        raw.normalize();

        let p = raw.profile();
        assert_eq!(p.string_table[0], "");
        assert_eq!(string(p, p.sample_type[0].r#type), "cpu");
        assert_eq!(
            string(p, p.sample[0].label[0].key),
            "span_id",
            "label keys must follow the shifted table"
        );
    }

    #[test]
    fn test_rename_label() {
        let mut p = test_profile::labelled();
        rename_label(&mut p, "span_id", "trace_span");

        let renamed = p
            .sample
            .iter()
            .flat_map(|s| s.label.iter())
            .all(|l| string(&p, l.key) == "trace_span");
        assert!(renamed);

        // Renaming an absent label changes nothing.
        let before = p.clone();
        rename_label(&mut p, "no_such_label", "other");
        assert_eq!(p, before);
    }

    #[test]
    fn test_intern_reuses_existing_strings() {
        let mut p = test_profile::labelled();
        let len = p.string_table.len();
        assert_eq!(intern(&mut p, "cpu"), 1);
        assert_eq!(p.string_table.len(), len);

        let idx = intern(&mut p, "fresh");
        assert_eq!(idx as usize, len);
    }
}
