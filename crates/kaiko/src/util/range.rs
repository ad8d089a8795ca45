use std::collections::BTreeMap;

/// A set of `u64` indices stored as merged, inclusive ranges.
///
/// Time addressed searches observe hundreds of thousands of absent ticks, most of them
/// consecutive, so they are kept here instead of one entry per index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRanges {
    // start -> inclusive end, never overlapping nor adjacent
    ranges: BTreeMap<u64, u64>,
    len: u64,
}

impl IndexRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.ranges
            .range(..=index)
            .next_back()
            .is_some_and(|(_, end)| index <= *end)
    }

    /// Returns `false` when the index was already present.
    pub fn insert(&mut self, index: u64) -> bool {
        if self.contains(index) {
            return false;
        }

        let mut start = index;
        let mut end = index;

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..index).next_back() {
            if prev_end.checked_add(1) == Some(index) {
                start = prev_start;
            }
        }
        if let Some(next) = index.checked_add(1) {
            if let Some(next_end) = self.ranges.remove(&next) {
                end = next_end;
            }
        }

        self.ranges.insert(start, end);
        self.len += 1;
        true
    }

    /// Returns `false` when the index was not present.
    pub fn remove(&mut self, index: u64) -> bool {
        let Some((&start, &end)) = self.ranges.range(..=index).next_back() else {
            return false;
        };
        if index > end {
            return false;
        }

        self.ranges.remove(&start);
        if start < index {
            self.ranges.insert(start, index - 1);
        }
        if index < end {
            self.ranges.insert(index + 1, end);
        }
        self.len -= 1;
        true
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(start, end)| (*start, *end))
    }
}
