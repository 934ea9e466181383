//! Per-tenant validation of pushed profiles and series labels.

use pprof_codec::RawProfile;
use profile_types::{Labels, TenantId, LABEL_NAME_SERVICE};
use thiserror::Error;

use crate::limits::Limits;

/// A validation failure, specific enough to tell the client what to fix.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("profile is too large (got {size} bytes, limit {limit})")]
    ProfileTooBig { size: usize, limit: usize },

    #[error("profile has too many samples (got {got}, limit {limit})")]
    TooManySamples { got: usize, limit: usize },

    #[error("profile stacktrace is too deep (got {got} frames, limit {limit})")]
    StacktraceTooDeep { got: usize, limit: usize },

    #[error("profile sample has too many labels (got {got}, limit {limit})")]
    TooManySampleLabels { got: usize, limit: usize },

    #[error("profile symbol value is too long (got {got} bytes, limit {limit})")]
    SymbolValueTooLong { got: usize, limit: usize },

    #[error("profile timestamp {timestamp_nanos} is outside the ingestion window")]
    TimestampOutOfRange { timestamp_nanos: i64 },

    #[error("label name '{name}' is too long (limit {limit})")]
    LabelNameTooLong { name: String, limit: usize },

    #[error("value of label '{name}' is too long (limit {limit})")]
    LabelValueTooLong { name: String, limit: usize },

    #[error("series has too many label names (got {got}, limit {limit})")]
    TooManyLabelNames { got: usize, limit: usize },

    #[error("duplicate label name '{name}'")]
    DuplicateLabelName { name: String },

    #[error("invalid label name '{name}'")]
    InvalidLabelName { name: String },

    #[error("series is missing the '{name}' label")]
    MissingLabel { name: String },
}

/// The reason a profile was discarded, as recorded on the discard counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    RateLimited,
    ProfileSizeLimit,
    SamplesLimit,
    StacktraceDepthLimit,
    SampleLabelsLimit,
    SymbolLengthLimit,
    OutOfRange,
    LabelNameTooLong,
    LabelValueTooLong,
    MaxLabelNamesPerSeries,
    DuplicateLabelNames,
    InvalidLabels,
    MissingLabels,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ProfileSizeLimit => "profile_size_limit",
            Self::SamplesLimit => "samples_limit",
            Self::StacktraceDepthLimit => "stacktrace_depth_limit",
            Self::SampleLabelsLimit => "sample_labels_limit",
            Self::SymbolLengthLimit => "symbol_length_limit",
            Self::OutOfRange => "out_of_range",
            Self::LabelNameTooLong => "label_name_too_long",
            Self::LabelValueTooLong => "label_value_too_long",
            Self::MaxLabelNamesPerSeries => "max_label_names_per_series",
            Self::DuplicateLabelNames => "duplicate_label_names",
            Self::InvalidLabels => "invalid_labels",
            Self::MissingLabels => "missing_labels",
        }
    }
}

impl ValidationError {
    /// The discard-counter reason for this failure.
    pub fn reason(&self) -> DiscardReason {
        match self {
            Self::ProfileTooBig { .. } => DiscardReason::ProfileSizeLimit,
            Self::TooManySamples { .. } => DiscardReason::SamplesLimit,
            Self::StacktraceTooDeep { .. } => DiscardReason::StacktraceDepthLimit,
            Self::TooManySampleLabels { .. } => DiscardReason::SampleLabelsLimit,
            Self::SymbolValueTooLong { .. } => DiscardReason::SymbolLengthLimit,
            Self::TimestampOutOfRange { .. } => DiscardReason::OutOfRange,
            Self::LabelNameTooLong { .. } => DiscardReason::LabelNameTooLong,
            Self::LabelValueTooLong { .. } => DiscardReason::LabelValueTooLong,
            Self::TooManyLabelNames { .. } => DiscardReason::MaxLabelNamesPerSeries,
            Self::DuplicateLabelName { .. } => DiscardReason::DuplicateLabelNames,
            Self::InvalidLabelName { .. } => DiscardReason::InvalidLabels,
            Self::MissingLabel { .. } => DiscardReason::MissingLabels,
        }
    }
}

/// Validate a single decoded profile against the tenant's limits.
///
/// `now_nanos` anchors the ingestion window; profiles without a collection
/// timestamp are accepted as "now".
pub fn validate_profile(
    limits: &dyn Limits,
    tenant_id: &TenantId,
    profile: &RawProfile,
    decompressed_size: usize,
    now_nanos: i64,
) -> Result<(), ValidationError> {
    let limit = limits.max_profile_size_bytes(tenant_id);
    if decompressed_size > limit {
        return Err(ValidationError::ProfileTooBig {
            size: decompressed_size,
            limit,
        });
    }

    let p = profile.profile();

    let limit = limits.max_profile_stacktrace_samples(tenant_id);
    if p.sample.len() > limit {
        return Err(ValidationError::TooManySamples {
            got: p.sample.len(),
            limit,
        });
    }

    let depth_limit = limits.max_profile_stacktrace_depth(tenant_id);
    let label_limit = limits.max_profile_stacktrace_sample_labels(tenant_id);
    for sample in &p.sample {
        if sample.location_id.len() > depth_limit {
            return Err(ValidationError::StacktraceTooDeep {
                got: sample.location_id.len(),
                limit: depth_limit,
            });
        }
        if sample.label.len() > label_limit {
            return Err(ValidationError::TooManySampleLabels {
                got: sample.label.len(),
                limit: label_limit,
            });
        }
    }

    let limit = limits.max_profile_symbol_value_length(tenant_id);
    if let Some(got) = p
        .string_table
        .iter()
        .map(|s| s.len())
        .find(|&len| len > limit)
    {
        return Err(ValidationError::SymbolValueTooLong { got, limit });
    }

    if p.time_nanos != 0 {
        let oldest = now_nanos - limits.reject_older_than(tenant_id).as_nanos() as i64;
        let newest = now_nanos + limits.reject_newer_than(tenant_id).as_nanos() as i64;
        if p.time_nanos < oldest || p.time_nanos > newest {
            return Err(ValidationError::TimestampOutOfRange {
                timestamp_nanos: p.time_nanos,
            });
        }
    }

    Ok(())
}

/// Validate a series' label set against the tenant's limits.
///
/// Expects labels in canonical (sorted) form, as established by the
/// pipeline's normalization step.
pub fn validate_series_labels(
    limits: &dyn Limits,
    tenant_id: &TenantId,
    labels: &Labels,
) -> Result<(), ValidationError> {
    let limit = limits.max_label_names_per_series(tenant_id);
    if labels.len() > limit {
        return Err(ValidationError::TooManyLabelNames {
            got: labels.len(),
            limit,
        });
    }

    if !labels.contains(LABEL_NAME_SERVICE) {
        return Err(ValidationError::MissingLabel {
            name: LABEL_NAME_SERVICE.to_owned(),
        });
    }

    let name_limit = limits.max_label_name_length(tenant_id);
    let value_limit = limits.max_label_value_length(tenant_id);
    let mut previous: Option<&str> = None;
    for label in labels {
        if label.name.len() > name_limit {
            return Err(ValidationError::LabelNameTooLong {
                name: label.name.clone(),
                limit: name_limit,
            });
        }
        if label.value.len() > value_limit {
            return Err(ValidationError::LabelValueTooLong {
                name: label.name.clone(),
                limit: value_limit,
            });
        }
        if !is_valid_label_name(&label.name) {
            return Err(ValidationError::InvalidLabelName {
                name: label.name.clone(),
            });
        }
        if previous == Some(label.name.as_str()) {
            return Err(ValidationError::DuplicateLabelName {
                name: label.name.clone(),
            });
        }
        previous = Some(label.name.as_str());
    }

    Ok(())
}

/// Prometheus-style label names: `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::TenantLimits;
    use assert_matches::assert_matches;
    use pprof_codec::proto;

    fn tenant() -> TenantId {
        TenantId::from("t1")
    }

    fn profile_with_samples(n: usize) -> RawProfile {
        RawProfile::from_proto(proto::Profile {
            string_table: vec!["".into(), "cpu".into()],
            sample_type: vec![proto::ValueType { r#type: 1, unit: 1 }],
            sample: (0..n)
                .map(|_| proto::Sample {
                    location_id: vec![1],
                    value: vec![1],
                    label: vec![],
                })
                .collect(),
            ..Default::default()
        })
    }

    fn ok_labels() -> Labels {
        Labels::from_pairs([("__name__", "cpu"), ("service_name", "api")])
    }

    #[test]
    fn test_profile_size_limit() {
        let limits = TenantLimits {
            max_profile_size_bytes: 10,
            ..Default::default()
        };
        let profile = profile_with_samples(1);
        assert_matches!(
            validate_profile(&limits, &tenant(), &profile, 11, 0),
            Err(ValidationError::ProfileTooBig { size: 11, limit: 10 })
        );
        assert_matches!(
            validate_profile(&limits, &tenant(), &profile, 10, 0),
            Ok(())
        );
    }

    #[test]
    fn test_sample_count_limit() {
        let limits = TenantLimits {
            max_profile_stacktrace_samples: 2,
            ..Default::default()
        };
        let err = validate_profile(&limits, &tenant(), &profile_with_samples(3), 1, 0).unwrap_err();
        assert_matches!(&err, ValidationError::TooManySamples { got: 3, limit: 2 });
        assert_eq!(err.reason(), DiscardReason::SamplesLimit);
    }

    #[test]
    fn test_stacktrace_depth_limit() {
        let limits = TenantLimits {
            max_profile_stacktrace_depth: 2,
            ..Default::default()
        };
        let mut profile = profile_with_samples(1);
        profile.profile_mut().sample[0].location_id = vec![1, 2, 3];
        assert_matches!(
            validate_profile(&limits, &tenant(), &profile, 1, 0),
            Err(ValidationError::StacktraceTooDeep { got: 3, limit: 2 })
        );
    }

    #[test]
    fn test_symbol_length_limit() {
        let limits = TenantLimits {
            max_profile_symbol_value_length: 8,
            ..Default::default()
        };
        let mut profile = profile_with_samples(1);
        profile
            .profile_mut()
            .string_table
            .push("a_rather_long_symbol_name".into());
        assert_matches!(
            validate_profile(&limits, &tenant(), &profile, 1, 0),
            Err(ValidationError::SymbolValueTooLong { limit: 8, .. })
        );
    }

    #[test]
    fn test_timestamp_window() {
        let limits = TenantLimits::default();
        let now = 1_700_000_000_000_000_000i64;

        let mut profile = profile_with_samples(1);
        profile.profile_mut().time_nanos = now - 2 * 3600 * 1_000_000_000;
        assert_matches!(
            validate_profile(&limits, &tenant(), &profile, 1, now),
            Err(ValidationError::TimestampOutOfRange { .. })
        );

        profile.profile_mut().time_nanos = now - 60 * 1_000_000_000;
        assert_matches!(validate_profile(&limits, &tenant(), &profile, 1, now), Ok(()));

        // Unset timestamps are accepted.
        profile.profile_mut().time_nanos = 0;
        assert_matches!(validate_profile(&limits, &tenant(), &profile, 1, now), Ok(()));
    }

    #[test]
    fn test_label_validation() {
        let limits = TenantLimits {
            max_label_value_length: 8,
            ..Default::default()
        };

        assert_matches!(validate_series_labels(&limits, &tenant(), &ok_labels()), Ok(()));

        let labels = Labels::from_pairs([("service_name", "a_very_long_value")]);
        assert_matches!(
            validate_series_labels(&limits, &tenant(), &labels),
            Err(ValidationError::LabelValueTooLong { .. })
        );

        let labels = Labels::from_pairs([("bad-name", "x"), ("service_name", "api")]);
        assert_matches!(
            validate_series_labels(&limits, &tenant(), &labels),
            Err(ValidationError::InvalidLabelName { .. })
        );

        let labels = Labels::from_pairs([("__name__", "cpu")]);
        assert_matches!(
            validate_series_labels(&limits, &tenant(), &labels),
            Err(ValidationError::MissingLabel { .. })
        );
    }

    #[test]
    fn test_duplicate_label_names() {
        let mut labels = ok_labels();
        labels.push("service_name", "other");
        labels.sort();
        assert_matches!(
            validate_series_labels(&TenantLimits::default(), &tenant(), &labels),
            Err(ValidationError::DuplicateLabelName { name }) if name == "service_name"
        );
    }

    #[test]
    fn test_too_many_label_names() {
        let limits = TenantLimits {
            max_label_names_per_series: 2,
            ..Default::default()
        };
        let labels = Labels::from_pairs([("a", "1"), ("b", "2"), ("service_name", "api")]);
        assert_matches!(
            validate_series_labels(&limits, &tenant(), &labels),
            Err(ValidationError::TooManyLabelNames { got: 3, limit: 2 })
        );
    }
}
