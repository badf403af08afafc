use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("{what} length ({actual}) must match paths length ({expected})")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// One photo's slot in the reordered sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedPhoto {
    /// 0-based slot in the output sequence.
    pub position: usize,
    /// Index in the discovered photo list, before unreadable photos were dropped.
    pub original_index: usize,
    pub path: PathBuf,
    pub cluster_id: usize,
}

/// Turn cluster labels into one ordered sequence.
///
/// Clusters are emitted in order of their earliest member's original index;
/// members keep their input order within a cluster. `original_indices`
/// defaults to `0..paths.len()`.
pub fn build_sequence(
    paths: &[PathBuf],
    labels: &[usize],
    original_indices: Option<&[usize]>,
) -> Result<Vec<OrderedPhoto>, SequenceError> {
    if labels.len() != paths.len() {
        return Err(SequenceError::LengthMismatch {
            what: "labels",
            expected: paths.len(),
            actual: labels.len(),
        });
    }
    if let Some(indices) = original_indices {
        if indices.len() != paths.len() {
            return Err(SequenceError::LengthMismatch {
                what: "original_indices",
                expected: paths.len(),
                actual: indices.len(),
            });
        }
    }
    let original_index = |idx: usize| original_indices.map_or(idx, |indices| indices[idx]);

    // Groups in first-seen order, members in input order.
    let mut group_of_label: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for (idx, &label) in labels.iter().enumerate() {
        let group = *group_of_label.entry(label).or_insert_with(|| {
            groups.push((label, Vec::new()));
            groups.len() - 1
        });
        groups[group].1.push(idx);
    }

    groups.sort_by_key(|(_, members)| {
        members
            .iter()
            .map(|&idx| (original_index(idx), idx))
            .min()
    });

    let ordered = groups
        .iter()
        .flat_map(|(label, members)| members.iter().map(move |&idx| (*label, idx)))
        .enumerate()
        .map(|(position, (cluster_id, idx))| OrderedPhoto {
            position,
            original_index: original_index(idx),
            path: paths[idx].clone(),
            cluster_id,
        })
        .collect();

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/photos/IMG_{:03}.jpg", i))).collect()
    }

    fn original_order(ordered: &[OrderedPhoto]) -> Vec<usize> {
        ordered.iter().map(|p| p.original_index).collect()
    }

    #[test]
    fn test_cluster_with_earliest_member_comes_first() {
        let ordered = build_sequence(&paths(4), &[1, 0, 1, 0], None).unwrap();

        assert_eq!(original_order(&ordered), vec![0, 2, 1, 3]);
        assert_eq!(ordered[0].cluster_id, 1);
        assert_eq!(ordered[2].cluster_id, 0);
    }

    #[test]
    fn test_within_cluster_order_is_preserved() {
        let ordered = build_sequence(&paths(6), &[0, 1, 0, 1, 0, 1], None).unwrap();

        let cluster_members = |cid: usize| -> Vec<usize> {
            ordered
                .iter()
                .filter(|p| p.cluster_id == cid)
                .map(|p| p.original_index)
                .collect()
        };
        assert_eq!(cluster_members(0), vec![0, 2, 4]);
        assert_eq!(cluster_members(1), vec![1, 3, 5]);
        assert_eq!(original_order(&ordered), vec![0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_sequence_is_complete_with_contiguous_positions() {
        let labels = [7, 3, 3, 9, 7, 0, 9, 3, 12];
        let input = paths(labels.len());
        let ordered = build_sequence(&input, &labels, None).unwrap();

        assert_eq!(ordered.len(), labels.len());
        let positions: Vec<usize> = ordered.iter().map(|p| p.position).collect();
        assert_eq!(positions, (0..labels.len()).collect::<Vec<_>>());
        let originals: HashSet<usize> = ordered.iter().map(|p| p.original_index).collect();
        assert_eq!(originals, (0..labels.len()).collect());
        for photo in &ordered {
            assert_eq!(photo.path, input[photo.original_index]);
            assert_eq!(photo.cluster_id, labels[photo.original_index]);
        }
    }

    #[test]
    fn test_order_does_not_depend_on_label_values() {
        let a = build_sequence(&paths(5), &[0, 1, 1, 2, 0], None).unwrap();
        let b = build_sequence(&paths(5), &[42, 5, 5, 17, 42], None).unwrap();

        assert_eq!(original_order(&a), original_order(&b));
        assert_eq!(original_order(&a), vec![0, 4, 1, 2, 3]);
    }

    #[test]
    fn test_original_indices_map_back_to_discovery_order() {
        // Photos 1 and 4 were unreadable and dropped upstream.
        let input = vec![
            PathBuf::from("a.jpg"),
            PathBuf::from("c.jpg"),
            PathBuf::from("d.jpg"),
            PathBuf::from("f.jpg"),
        ];
        let ordered = build_sequence(&input, &[0, 1, 0, 1], Some(&[0, 2, 3, 5])).unwrap();

        assert_eq!(original_order(&ordered), vec![0, 3, 2, 5]);
        assert_eq!(ordered[1].path, PathBuf::from("d.jpg"));
        assert_eq!(ordered[3].position, 3);
    }

    #[test]
    fn test_mismatched_original_indices_is_an_error() {
        let err = build_sequence(&paths(3), &[0, 0, 1], Some(&[0, 1])).unwrap_err();

        assert_eq!(
            err,
            SequenceError::LengthMismatch {
                what: "original_indices",
                expected: 3,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_mismatched_labels_is_an_error() {
        let err = build_sequence(&paths(3), &[0, 1], None).unwrap_err();

        assert!(matches!(err, SequenceError::LengthMismatch { what: "labels", .. }));
    }

    #[test]
    fn test_empty_input() {
        let ordered = build_sequence(&[], &[], Some(&[])).unwrap();
        assert!(ordered.is_empty());
    }
}
