//! Grouping of profile samples by their label sets.

use hashbrown::HashMap;

use crate::proto;

/// A set of samples sharing the same label set.
///
/// `samples` holds indexes into the source profile's sample list, in their
/// original order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGroup {
    /// The labels shared by every sample in the group. Empty for the group
    /// of unlabelled samples.
    pub labels: Vec<proto::Label>,
    /// Indexes into `Profile::sample`.
    pub samples: Vec<usize>,
}

/// Group the profile's samples by their label sets.
///
/// Groups are returned in first-occurrence order and sample order is
/// preserved within each group. Labels are compared by their string table
/// indexes, so callers should normalise the profile first to get canonical
/// (sorted, de-duplicated-table) label representations.
///
/// A profile whose samples all carry no labels yields a single group with
/// empty `labels`; a profile with no samples yields no groups.
pub fn group_samples_by_labels(p: &proto::Profile) -> Vec<SampleGroup> {
    let mut groups: Vec<SampleGroup> = Vec::new();
    let mut index: HashMap<Vec<(i64, i64, i64, i64)>, usize> = HashMap::new();

    for (i, sample) in p.sample.iter().enumerate() {
        let key: Vec<_> = sample
            .label
            .iter()
            .map(|l| (l.key, l.str, l.num, l.num_unit))
            .collect();

        match index.get(&key) {
            Some(&g) => groups[g].samples.push(i),
            None => {
                index.insert(key, groups.len());
                groups.push(SampleGroup {
                    labels: sample.label.clone(),
                    samples: vec![i],
                });
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_profile;

    #[test]
    fn test_groups_in_first_occurrence_order() {
        let p = test_profile::labelled();
        let groups = group_samples_by_labels(&p);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].samples, vec![0]);
        assert_eq!(groups[0].labels[0].str, 4); // "a"
        assert_eq!(groups[1].samples, vec![1]);
        assert_eq!(groups[1].labels[0].str, 5); // "b"
        assert_eq!(groups[2].samples, vec![2]);
        assert!(groups[2].labels.is_empty());
    }

    #[test]
    fn test_same_labels_share_a_group() {
        let mut p = test_profile::labelled();
        p.sample[1].label = p.sample[0].label.clone();
        let groups = group_samples_by_labels(&p);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].samples, vec![0, 1]);
        assert_eq!(groups[1].samples, vec![2]);
    }

    #[test]
    fn test_unlabelled_profile_is_one_group() {
        let p = test_profile::unlabelled();
        let groups = group_samples_by_labels(&p);

        assert_eq!(groups.len(), 1);
        assert!(groups[0].labels.is_empty());
        assert_eq!(groups[0].samples, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_profile_has_no_groups() {
        let mut p = test_profile::labelled();
        p.sample.clear();
        assert!(group_samples_by_labels(&p).is_empty());
    }
}
