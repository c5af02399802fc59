use std::fmt::Write as _;

/// Collapses a stream of chunk indices into maximal inclusive ranges,
/// so activity across thousands of chunks reports as a handful of
/// spans. Ranges stay sorted and disjoint.
#[derive(Debug, Default)]
pub struct RangeConsolidator {
    ranges: Vec<(u64, u64)>,
}

impl RangeConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: u64) {
        let idx = self.ranges.partition_point(|&(start, _)| start <= value);
        if idx > 0 {
            let (_, end) = self.ranges[idx - 1];
            if value <= end {
                return;
            }
            if end.checked_add(1) == Some(value) {
                self.ranges[idx - 1].1 = value;
                self.merge_right(idx - 1);
                return;
            }
        }
        if idx < self.ranges.len() && value.checked_add(1) == Some(self.ranges[idx].0) {
            self.ranges[idx].0 = value;
            return;
        }
        self.ranges.insert(idx, (value, value));
    }

    fn merge_right(&mut self, idx: usize) {
        if idx + 1 < self.ranges.len()
            && self.ranges[idx].1.checked_add(1) == Some(self.ranges[idx + 1].0)
        {
            let (_, right_end) = self.ranges.remove(idx + 1);
            self.ranges[idx].1 = right_end;
        }
    }

    /// Sorted, disjoint inclusive ranges.
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Number of distinct values seen.
    pub fn count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(start, end)| end - start + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Compact `0-17,20,24-31` rendering for logs.
    pub fn summarize(&self) -> String {
        let mut out = String::new();
        for (i, &(start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if start == end {
                let _ = write!(out, "{start}");
            } else {
                let _ = write!(out, "{start}-{end}");
            }
        }
        out
    }
}
