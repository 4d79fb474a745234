//! Deduplication against the processed index, and batching.

use crate::locate::{Candidate, Located};
use crate::processed::ProcessedIndex;
use std::collections::HashSet;

/// A bounded slice of candidates processed and committed together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Progress label, e.g. `"batch 2 of 5"` or `"run_07: batch 1 of 3"`.
    pub label: String,
    pub group: String,
    pub items: Vec<Candidate>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Drop candidates whose key is already archived, and exact `(key, path)`
/// repeats within the scan. Groups left empty are removed.
#[must_use]
pub fn filter_candidates(located: Located, processed: &ProcessedIndex) -> Located {
    let mut seen: HashSet<Candidate> = HashSet::new();
    located
        .into_iter()
        .filter_map(|(group, candidates)| {
            let kept: Vec<Candidate> = candidates
                .into_iter()
                .filter(|c| !processed.contains(&c.key) && seen.insert(c.clone()))
                .collect();
            (!kept.is_empty()).then_some((group, kept))
        })
        .collect()
}

/// Split every group into batches of at most `batch_size` candidates.
///
/// Labels carry the group name only when there is more than one group.
#[must_use]
pub fn make_batches(filtered: &Located, batch_size: usize) -> Vec<Batch> {
    let size = batch_size.max(1);
    let prefix_groups = filtered.len() > 1;
    let mut out = Vec::new();
    for (group, candidates) in filtered {
        let n = candidates.len().div_ceil(size);
        for (i, chunk) in candidates.chunks(size).enumerate() {
            let label = if prefix_groups {
                format!("{group}: batch {} of {n}", i + 1)
            } else {
                format!("batch {} of {n}", i + 1)
            };
            out.push(Batch {
                label,
                group: group.clone(),
                items: chunk.to_vec(),
            });
        }
    }
    out
}
