use crate::meta::CtHash;
use std::collections::{BTreeSet, HashMap};

const CLUSTERED_COEFFICIENT: f32 = 10.0;
const IMMEDIATE_COEFFICIENT: f32 = 20.0;
const RARITY_COEFFICIENT: f32 = 25.0;

/// Composite scheduling priority of one missing chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Weight {
    /// Another chunk of a peer we recently asked something of.
    pub clustered: bool,
    /// A user-visible path wants this chunk now.
    pub immediate: bool,
    /// Outstanding block requests against this chunk.
    pub owned_by: u32,
    /// Connected remotes advertising this chunk.
    pub remotes_count: u32,
}

impl Weight {
    pub fn value(&self, overall_remotes: u32) -> f32 {
        let mut value = self.owned_by as f32;
        if self.clustered {
            value += CLUSTERED_COEFFICIENT;
        }
        if self.immediate {
            value += IMMEDIATE_COEFFICIENT;
        }
        if overall_remotes > 0 {
            let held = (self.remotes_count as f32 / overall_remotes as f32).clamp(0.0, 1.0);
            value += (1.0 - held) * RARITY_COEFFICIENT;
        }
        value
    }
}

/// Float weight value with a total order, highest first. Ties fall through
/// to the chunk key, so the ordered set never compares values for equality.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedValue(f32);

impl Eq for OrderedValue {}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.total_cmp(&self.0)
    }
}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bidirectional association between missing chunks and their weights: a
/// key-indexed map on one side and a weight-ordered set on the other, kept
/// in lockstep so the heaviest chunk is O(log n) away.
#[derive(Debug, Default)]
pub struct WeightedDownloadQueue {
    weights: HashMap<CtHash, Weight>,
    ordered: BTreeSet<(OrderedValue, CtHash)>,
    overall_remotes: u32,
}

impl WeightedDownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn contains(&self, ct_hash: &CtHash) -> bool {
        self.weights.contains_key(ct_hash)
    }

    pub fn weight_of(&self, ct_hash: &CtHash) -> Option<Weight> {
        self.weights.get(ct_hash).copied()
    }

    pub fn overall_remotes_count(&self) -> u32 {
        self.overall_remotes
    }

    /// Inserts with a fresh default weight; no-op when already present.
    pub fn add_chunk(&mut self, ct_hash: CtHash) {
        if self.weights.contains_key(&ct_hash) {
            return;
        }
        let weight = Weight::default();
        self.ordered
            .insert((OrderedValue(weight.value(self.overall_remotes)), ct_hash));
        self.weights.insert(ct_hash, weight);
    }

    pub fn remove_chunk(&mut self, ct_hash: &CtHash) {
        if let Some(weight) = self.weights.remove(ct_hash) {
            self.ordered
                .remove(&(OrderedValue(weight.value(self.overall_remotes)), *ct_hash));
        }
    }

    /// Updates the rarity denominator and reweights every chunk.
    pub fn set_overall_remotes_count(&mut self, count: u32) {
        if self.overall_remotes == count {
            return;
        }
        self.overall_remotes = count;
        self.ordered = self
            .weights
            .iter()
            .map(|(&ct_hash, weight)| (OrderedValue(weight.value(count)), ct_hash))
            .collect();
    }

    pub fn set_chunk_remotes_count(&mut self, ct_hash: &CtHash, count: u32) {
        self.reweight(ct_hash, |w| w.remotes_count = count);
    }

    /// One-way flag: the chunk shares a peer with a recent request.
    pub fn mark_clustered(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.clustered = true);
    }

    /// One-way flag: a user-visible caller wants this chunk urgently.
    pub fn mark_immediate(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.immediate = true);
    }

    /// A block request was issued against the chunk.
    pub fn increment_owned_by(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.owned_by += 1);
    }

    /// A block request completed or was canceled.
    pub fn decrement_owned_by(&mut self, ct_hash: &CtHash) {
        self.reweight(ct_hash, |w| w.owned_by = w.owned_by.saturating_sub(1));
    }

    /// Snapshot of chunk keys in descending weight order.
    pub fn chunks(&self) -> Vec<CtHash> {
        self.ordered.iter().map(|&(_, ct_hash)| ct_hash).collect()
    }

    fn reweight(&mut self, ct_hash: &CtHash, update: impl FnOnce(&mut Weight)) {
        let Some(weight) = self.weights.get_mut(ct_hash) else {
            return;
        };
        let old = (OrderedValue(weight.value(self.overall_remotes)), *ct_hash);
        update(weight);
        let new = (OrderedValue(weight.value(self.overall_remotes)), *ct_hash);
        if new != old {
            self.ordered.remove(&old);
            self.ordered.insert(new);
        }
    }
}
