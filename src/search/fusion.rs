//! Reciprocal-rank fusion.

use std::collections::HashMap;

/// Merge ranked id lists into one list ordered by fused score.
///
/// Each list contributes `1 / (k + rank)` to every id it contains, with `rank`
/// counted from 0. Ties keep the order in which ids were first seen, walking
/// the lists in argument order, so identical inputs always fuse identically.
pub fn rrf_fuse<S: AsRef<str>>(lists: &[&[S]], k: usize) -> Vec<(String, f64)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut fused: Vec<(String, f64)> = Vec::new();

    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            let id = id.as_ref();
            let contribution = 1.0 / (k as f64 + rank as f64);
            match index.get(id) {
                Some(&slot) => fused[slot].1 += contribution,
                None => {
                    index.insert(id, fused.len());
                    fused.push((id.to_string(), contribution));
                }
            }
        }
    }

    // Stable sort: equal scores stay in first-seen order.
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused
}
