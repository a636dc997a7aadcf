//! Consolidation of signed multisets.
//!
//! A dataflow element is a `(value, multiplicity)` pair, or a `(key, value, multiplicity)`
//! triple once grouped by key. Consolidation sorts a batch of such pairs/triples and merges
//! runs with identical keys, summing their multiplicities and dropping any that settle at
//! zero. This is the one piece of bookkeeping nearly every operator in `crate::dataflow`
//! needs before it can hand a batch to a subscriber or to the next operator.

/// The signed multiplicity carried by every element flowing through the dataflow.
/// Positive values are insertions, negative are deletions; an update is modeled as a
/// deletion of the old value and an insertion of the new one at the same logical step.
pub type Multiplicity = i64;

/// Sorts and consolidates `vec` in place.
///
/// Runs of entries with equal first elements are merged by summing their multiplicities;
/// entries that net to zero are dropped.
#[inline]
pub fn consolidate<T: Ord + Clone>(vec: &mut Vec<(T, Multiplicity)>) {
    consolidate_from(vec, 0);
}

/// Sorts and consolidates `vec[offset..]`, leaving `vec[..offset]` untouched.
#[inline]
pub fn consolidate_from<T: Ord + Clone>(vec: &mut Vec<(T, Multiplicity)>, offset: usize) {
    let length = consolidate_slice(&mut vec[offset..]);
    vec.truncate(offset + length);
}

/// Sorts and consolidates a slice, returning the length of the valid (non-zero) prefix.
#[inline]
pub fn consolidate_slice<T: Ord + Clone>(slice: &mut [(T, Multiplicity)]) -> usize {
    if slice.len() > 1 {
        consolidate_slice_slow(slice)
    } else {
        slice.iter().filter(|(_, m)| *m != 0).count()
    }
}

fn consolidate_slice_slow<T: Ord + Clone>(slice: &mut [(T, Multiplicity)]) -> usize {
    slice.sort_by(|x, y| x.0.cmp(&y.0));

    let mut offset = 0;
    let mut accum = slice[0].1;

    for index in 1..slice.len() {
        if slice[index].0 == slice[index - 1].0 {
            accum += slice[index].1;
        } else {
            if accum != 0 {
                slice.swap(offset, index - 1);
                slice[offset].1 = accum;
                offset += 1;
            }
            accum = slice[index].1;
        }
    }
    if accum != 0 {
        let last = slice.len() - 1;
        slice.swap(offset, last);
        slice[offset].1 = accum;
        offset += 1;
    }

    offset
}

/// Sorts and consolidates `vec` keyed by the first two elements of each triple, summing the
/// third (the multiplicity).
#[inline]
pub fn consolidate_updates<K: Ord + Clone, V: Ord + Clone>(vec: &mut Vec<(K, V, Multiplicity)>) {
    if vec.len() > 1 {
        vec.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));

        let mut offset = 0;
        let mut accum = vec[0].2;

        for index in 1..vec.len() {
            if vec[index].0 == vec[index - 1].0 && vec[index].1 == vec[index - 1].1 {
                accum += vec[index].2;
            } else {
                if accum != 0 {
                    vec.swap(offset, index - 1);
                    vec[offset].2 = accum;
                    offset += 1;
                }
                accum = vec[index].2;
            }
        }
        if accum != 0 {
            let last = vec.len() - 1;
            vec.swap(offset, last);
            vec[offset].2 = accum;
            offset += 1;
        }
        vec.truncate(offset);
    } else {
        vec.retain(|(_, _, m)| *m != 0);
    }
}

/// Like [`consolidate_updates`], but orders elements with a caller-supplied comparator
/// instead of requiring `K`/`V: Ord` -- for key/value types (e.g. `serde_json::Value`) that
/// only have a total order via an external function rather than a trait impl.
#[inline]
pub fn consolidate_updates_by<K, V>(
    vec: &mut Vec<(K, V, Multiplicity)>,
    mut cmp: impl FnMut(&K, &V, &K, &V) -> std::cmp::Ordering,
) where
    K: Clone + PartialEq,
    V: Clone + PartialEq,
{
    if vec.len() > 1 {
        vec.sort_by(|x, y| cmp(&x.0, &x.1, &y.0, &y.1));

        let mut offset = 0;
        let mut accum = vec[0].2;

        for index in 1..vec.len() {
            if vec[index].0 == vec[index - 1].0 && vec[index].1 == vec[index - 1].1 {
                accum += vec[index].2;
            } else {
                if accum != 0 {
                    vec.swap(offset, index - 1);
                    vec[offset].2 = accum;
                    offset += 1;
                }
                accum = vec[index].2;
            }
        }
        if accum != 0 {
            let last = vec.len() - 1;
            vec.swap(offset, last);
            vec[offset].2 = accum;
            offset += 1;
        }
        vec.truncate(offset);
    } else {
        vec.retain(|(_, _, m)| *m != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consolidate() {
        let test_cases = vec![
            (vec![("a", -1), ("b", -2), ("a", 1)], vec![("b", -2)]),
            (vec![("a", -1), ("b", 0), ("a", 1)], vec![]),
            (vec![("a", 0)], vec![]),
            (vec![("a", 0), ("b", 0)], vec![]),
            (vec![("a", 1), ("b", 1)], vec![("a", 1), ("b", 1)]),
        ];

        for (mut input, output) in test_cases {
            consolidate(&mut input);
            assert_eq!(input, output);
        }
    }

    #[test]
    fn test_consolidate_updates() {
        let mut data = vec![("k1", "a", 1), ("k1", "a", -1), ("k1", "b", 1), ("k2", "a", 2)];
        consolidate_updates(&mut data);
        assert_eq!(data, vec![("k1", "b", 1), ("k2", "a", 2)]);
    }

    #[test]
    fn net_zero_edit_vanishes() {
        let mut data = vec![(42, 1), (42, -1)];
        consolidate(&mut data);
        assert!(data.is_empty());
    }
}
