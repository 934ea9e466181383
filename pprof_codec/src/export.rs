//! Export of sample subsets into free-standing profiles.

use hashbrown::HashMap;

use crate::proto;

/// Exports subsets of a source profile's samples into new profiles.
///
/// The exported profile carries only the strings, locations, functions and
/// mappings its samples reference; everything is re-indexed from scratch so
/// the output stands alone. Building one exporter and reusing it across
/// groups amortises the source table indexes.
#[derive(Debug)]
pub struct SampleExporter<'a> {
    source: &'a proto::Profile,
    locations: HashMap<u64, &'a proto::Location>,
    functions: HashMap<u64, &'a proto::Function>,
    mappings: HashMap<u64, &'a proto::Mapping>,
}

impl<'a> SampleExporter<'a> {
    pub fn new(source: &'a proto::Profile) -> Self {
        Self {
            source,
            locations: source.location.iter().map(|l| (l.id, l)).collect(),
            functions: source.function.iter().map(|f| (f.id, f)).collect(),
            mappings: source.mapping.iter().map(|m| (m.id, m)).collect(),
        }
    }

    /// Build a new profile containing `samples`.
    ///
    /// The samples must originate from this exporter's source profile: their
    /// label and location references are resolved against it. References to
    /// unknown location ids are dropped.
    pub fn export(&self, samples: Vec<proto::Sample>) -> proto::Profile {
        let mut out = Remapped::new(self.source);

        for mut sample in samples {
            let location_ids = sample
                .location_id
                .iter()
                .filter_map(|id| self.remap_location(&mut out, *id))
                .collect();
            sample.location_id = location_ids;
            for label in &mut sample.label {
                label.key = out.string(label.key);
                label.str = out.string(label.str);
                label.num_unit = out.string(label.num_unit);
            }
            out.profile.sample.push(sample);
        }

        out.profile
    }

    fn remap_location(&self, out: &mut Remapped<'_>, id: u64) -> Option<u64> {
        if let Some(&new_id) = out.location_ids.get(&id) {
            return Some(new_id);
        }
        let location = self.locations.get(&id)?;

        let mut location = (*location).clone();
        location.mapping_id = self.remap_mapping(out, location.mapping_id);
        for line in &mut location.line {
            line.function_id = self.remap_function(out, line.function_id);
        }

        let new_id = (out.profile.location.len() + 1) as u64;
        location.id = new_id;
        out.profile.location.push(location);
        out.location_ids.insert(id, new_id);
        Some(new_id)
    }

    fn remap_function(&self, out: &mut Remapped<'_>, id: u64) -> u64 {
        if let Some(&new_id) = out.function_ids.get(&id) {
            return new_id;
        }
        let Some(function) = self.functions.get(&id) else {
            return 0;
        };

        let mut function = (*function).clone();
        function.name = out.string(function.name);
        function.system_name = out.string(function.system_name);
        function.filename = out.string(function.filename);

        let new_id = (out.profile.function.len() + 1) as u64;
        function.id = new_id;
        out.profile.function.push(function);
        out.function_ids.insert(id, new_id);
        new_id
    }

    fn remap_mapping(&self, out: &mut Remapped<'_>, id: u64) -> u64 {
        if let Some(&new_id) = out.mapping_ids.get(&id) {
            return new_id;
        }
        let Some(mapping) = self.mappings.get(&id) else {
            return 0;
        };

        let mut mapping = (*mapping).clone();
        mapping.filename = out.string(mapping.filename);
        mapping.build_id = out.string(mapping.build_id);

        let new_id = (out.profile.mapping.len() + 1) as u64;
        mapping.id = new_id;
        out.profile.mapping.push(mapping);
        out.mapping_ids.insert(id, new_id);
        new_id
    }
}

/// The profile being built, plus the old→new index maps driving the rewrite.
#[derive(Debug)]
struct Remapped<'a> {
    source: &'a proto::Profile,
    profile: proto::Profile,
    strings: HashMap<&'a str, i64>,
    location_ids: HashMap<u64, u64>,
    function_ids: HashMap<u64, u64>,
    mapping_ids: HashMap<u64, u64>,
}

impl<'a> Remapped<'a> {
    fn new(source: &'a proto::Profile) -> Self {
        let mut out = Self {
            source,
            profile: proto::Profile {
                string_table: vec![String::new()],
                time_nanos: source.time_nanos,
                duration_nanos: source.duration_nanos,
                period: source.period,
                ..Default::default()
            },
            strings: HashMap::from([("", 0)]),
            location_ids: HashMap::new(),
            function_ids: HashMap::new(),
            mapping_ids: HashMap::new(),
        };

        let sample_type = source
            .sample_type
            .iter()
            .map(|t| proto::ValueType {
                r#type: out.string(t.r#type),
                unit: out.string(t.unit),
            })
            .collect();
        out.profile.sample_type = sample_type;

        let period_type = source.period_type.as_ref().map(|t| proto::ValueType {
            r#type: out.string(t.r#type),
            unit: out.string(t.unit),
        });
        out.profile.period_type = period_type;

        let drop_frames = out.string(source.drop_frames);
        out.profile.drop_frames = drop_frames;
        let keep_frames = out.string(source.keep_frames);
        out.profile.keep_frames = keep_frames;
        let comment = source.comment.iter().map(|&c| out.string(c)).collect();
        out.profile.comment = comment;
        let default_sample_type = out.string(source.default_sample_type);
        out.profile.default_sample_type = default_sample_type;

        out
    }

    /// Remap a source string table index into the output table.
    fn string(&mut self, index: i64) -> i64 {
        let s: &'a str = crate::string(self.source, index);
        if let Some(&i) = self.strings.get(s) {
            return i;
        }
        let i = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_owned());
        self.strings.insert(s, i);
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{string, test_profile};

    #[test]
    fn test_export_stands_alone() {
        let source = test_profile::labelled();
        let exporter = SampleExporter::new(&source);

        let exported = exporter.export(vec![source.sample[0].clone()]);

        assert_eq!(exported.sample.len(), 1);
        assert_eq!(exported.string_table[0], "");

        // Sample labels resolve against the new table.
        let label = &exported.sample[0].label[0];
        assert_eq!(string(&exported, label.key), "span_id");
        assert_eq!(string(&exported, label.str), "a");

        // Only referenced table entries were carried over, re-indexed.
        assert_eq!(exported.location.len(), 1);
        assert_eq!(exported.location[0].id, 1);
        assert_eq!(exported.function.len(), 1);
        assert_eq!(
            string(&exported, exported.function[0].name),
            "main"
        );
        assert_eq!(exported.mapping.len(), 1);
        assert_eq!(
            string(&exported, exported.mapping[0].filename),
            "main.go"
        );

        // Metadata survives.
        assert_eq!(exported.time_nanos, source.time_nanos);
        assert_eq!(exported.period, source.period);
        assert_eq!(
            string(&exported, exported.sample_type[0].r#type),
            "cpu"
        );

        // The unreferenced "b" string is gone.
        assert!(!exported.string_table.iter().any(|s| s == "b"));
    }

    #[test]
    fn test_export_shares_tables_across_samples() {
        let source = test_profile::labelled();
        let exporter = SampleExporter::new(&source);

        let exported =
            exporter.export(vec![source.sample[0].clone(), source.sample[1].clone()]);

        assert_eq!(exported.sample.len(), 2);
        // Both samples reference the single shared location.
        assert_eq!(exported.location.len(), 1);
        assert_eq!(exported.sample[0].location_id, vec![1]);
        assert_eq!(exported.sample[1].location_id, vec![1]);
    }

    #[test]
    fn test_unknown_location_ids_are_dropped() {
        let source = test_profile::labelled();
        let exporter = SampleExporter::new(&source);

        let mut sample = source.sample[2].clone();
        sample.location_id.push(999);
        let exported = exporter.export(vec![sample]);

        assert_eq!(exported.sample[0].location_id, vec![1]);
    }
}
