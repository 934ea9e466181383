//! Splitting of pushed series by per-sample labels.
//!
//! Samples inside one pprof payload may carry their own labels (span ids,
//! session ids, …). Storage shards by series labels only, so those samples
//! are lifted out: the payload is split into one new profile per distinct
//! sample-label set and each becomes its own series, labelled with the
//! union of the series' and the group's labels.

use bytes::Bytes;
use pprof_codec::{
    group_samples_by_labels, proto, rename_label, string, RawProfile, SampleExporter,
};
use profile_types::{
    Labels, ProfileSample, ProfileSeries, PushRequest, LABEL_NAME_PROFILE_ID, LABEL_NAME_SPAN,
};

/// Split every series of `req` by the sample labels of its profiles.
///
/// Each input profile is normalised first, and historical `profile_id`
/// sample labels are renamed to `span_id`. Profiles without sample labels
/// pass through in their original series, untouched. Output order follows
/// the input traversal: the split-off groups of a series precede the series
/// itself.
pub(crate) fn extract_sample_series(req: PushRequest) -> Vec<ProfileSeries> {
    let mut out = Vec::with_capacity(req.series.len());

    for series in req.series {
        let mut kept = ProfileSeries {
            labels: series.labels.clone(),
            samples: Vec::with_capacity(series.samples.len()),
        };

        for mut sample in series.samples {
            sample.profile.normalize();
            rename_label(
                sample.profile.profile_mut(),
                LABEL_NAME_PROFILE_ID,
                LABEL_NAME_SPAN,
            );

            let groups = group_samples_by_labels(sample.profile.profile());
            if groups.is_empty() || (groups.len() == 1 && groups[0].labels.is_empty()) {
                // No sample labels anywhere: leave the payload as is.
                kept.samples.push(sample);
                continue;
            }

            // Take the samples out of the profile, then export one new
            // profile per label group against the remaining tables.
            let mut profile = sample.profile.into_proto();
            let mut slots: Vec<Option<proto::Sample>> = std::mem::take(&mut profile.sample)
                .into_iter()
                .map(Some)
                .collect();
            let exporter = SampleExporter::new(&profile);

            for group in groups {
                let samples: Vec<_> = group
                    .samples
                    .iter()
                    .filter_map(|&i| slots[i].take())
                    .collect();
                let exported = exporter.export(samples);
                let labels =
                    merge_series_and_sample_labels(&profile, &series.labels, &group.labels);
                out.push(ProfileSeries {
                    labels,
                    samples: vec![ProfileSample {
                        profile: RawProfile::from_proto(exported),
                        raw_profile: Bytes::new(),
                        id: String::new(),
                    }],
                });
            }
        }

        if !kept.samples.is_empty() {
            out.push(kept);
        }
    }

    out
}

/// Merge sample-group labels under the series labels.
///
/// Series labels win on name collisions. Sample label values are resolved
/// through the profile's string table; the result is sorted with unique
/// names.
pub(crate) fn merge_series_and_sample_labels(
    p: &proto::Profile,
    series_labels: &Labels,
    sample_labels: &[proto::Label],
) -> Labels {
    let mut merged = series_labels.clone();
    for label in sample_labels {
        merged.push(string(p, label.key), string(p, label.str));
    }
    // The sort is stable, so on duplicate names the series label (appended
    // first) survives the dedup.
    merged.sort();
    merged.dedup_by_name();
    merged
}
