//! Band-limited dynamic time warping

use std::cmp;

/// Dynamic time warping over a pluggable distance function
pub struct Dtw<T: Copy> {
    distance_fn: fn(T, T) -> f32,
}

impl<T: Copy> Dtw<T> {
    /// Create a DTW instance using `distance_fn` as the local cost
    pub const fn new(distance_fn: fn(T, T) -> f32) -> Self {
        Self { distance_fn }
    }

    /// Accumulated cost of the optimal warping path
    ///
    /// Cells further than `window` from the diagonal are not visited; the
    /// window always grows to cover the length difference so the end cell is
    /// reachable. Returns infinity if either sequence is empty.
    pub fn optimal_path_cost(&self, first: &[T], second: &[T], window: usize) -> f32 {
        let m = first.len();
        let n = second.len();
        if m == 0 || n == 0 {
            return f32::INFINITY;
        }

        let window = cmp::max(window, m.abs_diff(n));

        // Two rolling rows of the (m + 1) x (n + 1) cost matrix
        let mut prev = vec![f32::INFINITY; n + 1];
        let mut curr = vec![f32::INFINITY; n + 1];
        prev[0] = 0.0;

        for row in 1..=m {
            curr.fill(f32::INFINITY);
            let start = if row > window { row - window } else { 1 };
            let end = cmp::min(n, row + window);

            for col in start..=end {
                let cost = (self.distance_fn)(first[row - 1], second[col - 1]);
                let insertion = prev[col];
                let deletion = curr[col - 1];
                let matches = prev[col - 1];
                curr[col] = cost + insertion.min(deletion).min(matches);
            }

            std::mem::swap(&mut prev, &mut curr);
        }

        prev[n]
    }

    /// Path cost normalised by the combined sequence length
    pub fn normalized_cost(&self, first: &[T], second: &[T], window: usize) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let total = (first.len() + second.len()) as f32;
        self.optimal_path_cost(first, second, window) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs_distance(a: f32, b: f32) -> f32 {
        (a - b).abs()
    }

    #[test]
    fn identical_sequences_cost_nothing() {
        let dtw = Dtw::new(abs_distance);
        let seq = [1.0, 2.0, 3.0, 4.0];
        assert!(dtw.optimal_path_cost(&seq, &seq, 1) < f32::EPSILON);
    }

    #[test]
    fn stretched_sequence_aligns() {
        let dtw = Dtw::new(abs_distance);
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        assert!(dtw.optimal_path_cost(&a, &b, 1) < f32::EPSILON);
    }

    #[test]
    fn differing_sequences_cost_more() {
        let dtw = Dtw::new(abs_distance);
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 1.0, 1.0];
        assert!((dtw.optimal_path_cost(&a, &b, 3) - 3.0).abs() < 1e-6);
        assert!((dtw.normalized_cost(&a, &b, 3) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_sequence_is_infinite() {
        let dtw = Dtw::new(abs_distance);
        assert!(dtw.optimal_path_cost(&[], &[1.0], 1).is_infinite());
    }
}
