use std::collections::BTreeMap;

/// Set of filled byte ranges within `[0, size)`, kept as disjoint half-open
/// intervals ordered by start offset. Overlapping or adjacent inserts are
/// coalesced, so between any two stored intervals there is a real gap.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityMap {
    size: u32,
    // start -> end (exclusive)
    filled: BTreeMap<u32, u32>,
}

impl AvailabilityMap {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            filled: BTreeMap::new(),
        }
    }

    /// Inserts `[offset, offset + len)`, merging with anything it touches.
    /// The caller is responsible for keeping the range inside `[0, size)`;
    /// out-of-range tails are clamped.
    pub fn insert(&mut self, offset: u32, len: u32) {
        if len == 0 || offset >= self.size {
            return;
        }
        let mut start = offset;
        let mut end = offset.saturating_add(len).min(self.size);

        if let Some((&prev_start, &prev_end)) = self.filled.range(..=start).next_back()
            && prev_end >= start
        {
            start = prev_start;
            end = end.max(prev_end);
            self.filled.remove(&prev_start);
        }
        while let Some((&next_start, &next_end)) = self.filled.range(start..=end).next() {
            self.filled.remove(&next_start);
            end = end.max(next_end);
        }
        self.filled.insert(start, end);
    }

    pub fn size_original(&self) -> u64 {
        u64::from(self.size)
    }

    pub fn size_filled(&self) -> u64 {
        self.filled
            .iter()
            .map(|(&start, &end)| u64::from(end - start))
            .sum()
    }

    pub fn full(&self) -> bool {
        self.size_filled() == self.size_original()
    }

    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Filled intervals as `(offset, len)`, ascending.
    pub fn filled_ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.filled.iter().map(|(&start, &end)| (start, end - start))
    }

    /// Empty intervals covering `[0, size)` minus the filled set, ascending.
    pub fn gaps(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let size = self.size;
        let mut cursor = 0u32;
        let mut ranges = self.filled.iter();
        let mut done = false;
        std::iter::from_fn(move || {
            while !done {
                match ranges.next() {
                    Some((&start, &end)) => {
                        let gap_start = cursor;
                        cursor = end;
                        if start > gap_start {
                            return Some((gap_start, start - gap_start));
                        }
                    }
                    None => {
                        done = true;
                        if cursor < size {
                            return Some((cursor, size - cursor));
                        }
                    }
                }
            }
            None
        })
    }

    pub fn first_gap(&self) -> Option<(u32, u32)> {
        self.gaps().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(map: &AvailabilityMap) -> Vec<(u32, u32)> {
        map.filled_ranges().collect()
    }

    #[test]
    fn empty_map_is_one_big_gap() {
        let map = AvailabilityMap::new(100);
        assert_eq!(map.size_original(), 100);
        assert_eq!(map.size_filled(), 0);
        assert!(!map.full());
        assert_eq!(map.gaps().collect::<Vec<_>>(), vec![(0, 100)]);
    }

    #[test]
    fn insert_coalesces_adjacent_ranges() {
        let mut map = AvailabilityMap::new(100);
        map.insert(0, 10);
        map.insert(10, 10);
        assert_eq!(ranges(&map), vec![(0, 20)]);
    }

    #[test]
    fn insert_coalesces_overlapping_ranges() {
        let mut map = AvailabilityMap::new(100);
        map.insert(0, 30);
        map.insert(20, 30);
        assert_eq!(ranges(&map), vec![(0, 50)]);
        assert_eq!(map.size_filled(), 50);
    }

    #[test]
    fn insert_bridges_multiple_ranges() {
        let mut map = AvailabilityMap::new(100);
        map.insert(0, 10);
        map.insert(20, 10);
        map.insert(40, 10);
        map.insert(5, 40);
        assert_eq!(ranges(&map), vec![(0, 50)]);
    }

    #[test]
    fn disjoint_inserts_stay_disjoint() {
        let mut map = AvailabilityMap::new(100);
        map.insert(50, 10);
        map.insert(0, 10);
        assert_eq!(ranges(&map), vec![(0, 10), (50, 10)]);
        assert_eq!(
            map.gaps().collect::<Vec<_>>(),
            vec![(10, 40), (60, 40)]
        );
        assert_eq!(map.first_gap(), Some((10, 40)));
    }

    #[test]
    fn zero_length_insert_is_a_no_op() {
        let mut map = AvailabilityMap::new(100);
        map.insert(10, 0);
        assert!(map.is_empty());
    }

    #[test]
    fn insert_clamps_at_size() {
        let mut map = AvailabilityMap::new(100);
        map.insert(90, 50);
        assert_eq!(ranges(&map), vec![(90, 10)]);
        map.insert(200, 10);
        assert_eq!(ranges(&map), vec![(90, 10)]);
    }

    #[test]
    fn full_after_covering_everything() {
        let mut map = AvailabilityMap::new(100);
        map.insert(30, 70);
        assert!(!map.full());
        map.insert(0, 30);
        assert!(map.full());
        assert_eq!(map.first_gap(), None);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut map = AvailabilityMap::new(100);
        map.insert(0, 32);
        map.insert(0, 32);
        assert_eq!(ranges(&map), vec![(0, 32)]);
        assert_eq!(map.size_filled(), 32);
    }
}
