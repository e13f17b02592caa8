//! Targeted quantile estimation (Cormode, Korn, Muthukrishnan, Srivastava).
//!
//! Observations are buffered, sorted and merged into a compressed list of
//! samples whose allowed rank error depends on the distance to the nearest
//! target quantile. Memory stays bounded by the targets, not by the number
//! of observations.

use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    width: f64,
    delta: f64,
}

#[derive(Debug)]
pub(crate) struct TargetedStream {
    /// `(quantile, epsilon)` pairs.
    targets: Arc<[(f64, f64)]>,
    n: f64,
    samples: Vec<Sample>,
    buffer: Vec<f64>,
    buffer_capacity: usize,
}

impl TargetedStream {
    pub(crate) fn new(targets: Arc<[(f64, f64)]>, buffer_capacity: usize) -> Self {
        let buffer_capacity = buffer_capacity.max(1);
        Self {
            targets,
            n: 0.0,
            samples: Vec::new(),
            buffer: Vec::with_capacity(buffer_capacity),
            buffer_capacity,
        }
    }

    pub(crate) fn insert(&mut self, value: f64) {
        self.buffer.push(value);
        if self.buffer.len() >= self.buffer_capacity {
            self.flush();
        }
    }

    /// Estimate for quantile `q`, or `None` when nothing was observed.
    pub(crate) fn query(&mut self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            // Nothing merged yet: answer exactly from the buffer.
            if self.buffer.is_empty() {
                return None;
            }
            self.buffer.sort_by(f64::total_cmp);
            let len = self.buffer.len();
            let index = ((len as f64 * q).ceil() as usize).saturating_sub(1);
            return Some(self.buffer[index.min(len - 1)]);
        }

        self.flush();
        Some(self.query_merged(q))
    }

    pub(crate) fn reset(&mut self) {
        self.n = 0.0;
        self.samples.clear();
        self.buffer.clear();
    }

    #[cfg(test)]
    pub(crate) fn retained(&self) -> usize {
        self.samples.len() + self.buffer.len()
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut values = std::mem::take(&mut self.buffer);
        values.sort_by(f64::total_cmp);
        self.merge(&values);
        values.clear();
        self.buffer = values;
    }

    /// Largest `width + delta` a sample starting after rank `r` may carry.
    ///
    /// Each target contributes `epsilon * max((n - r) / (1 - q), r / q)`,
    /// which never shrinks as observations arrive, so a sample that fits
    /// keeps fitting.
    fn allowed_error(&self, r: f64) -> f64 {
        let mut min = f64::INFINITY;
        for &(quantile, epsilon) in self.targets.iter() {
            if epsilon == 0.0 {
                return 0.0;
            }
            let below = if quantile < 1.0 {
                (self.n - r) / (1.0 - quantile)
            } else {
                f64::INFINITY
            };
            let above = if quantile > 0.0 {
                r / quantile
            } else {
                f64::INFINITY
            };
            min = min.min(epsilon * below.max(above));
        }
        min
    }

    fn merge(&mut self, sorted: &[f64]) {
        let mut merged = Vec::with_capacity(self.samples.len() + sorted.len());
        let mut existing = self.samples.iter().copied().peekable();
        for &value in sorted {
            while let Some(sample) = existing.next_if(|sample| sample.value <= value) {
                merged.push(sample);
            }
            // A new minimum or maximum has an exact rank. Anything else is
            // bounded above by the rank of the sample it lands before.
            let delta = match existing.peek() {
                Some(next) if !merged.is_empty() => next.width + next.delta - 1.0,
                _ => 0.0,
            };
            merged.push(Sample {
                value,
                width: 1.0,
                delta,
            });
            self.n += 1.0;
        }
        merged.extend(existing);
        self.samples = merged;
        self.compress();
    }

    /// Folds samples into their successor while the result still fits the
    /// allowed error at the rank where it now starts. The minimum is kept.
    fn compress(&mut self) {
        let Some((&last, rest)) = self.samples.split_last() else {
            return;
        };
        let Some((&first, middle)) = rest.split_first() else {
            return;
        };

        let mut kept = Vec::with_capacity(self.samples.len());
        let mut successor = last;
        // Total width of every sample before `successor`.
        let mut r = self.n - successor.width;
        for &current in middle.iter().rev() {
            r -= current.width;
            if current.width + successor.width + successor.delta <= self.allowed_error(r) {
                successor.width += current.width;
            } else {
                kept.push(successor);
                successor = current;
            }
        }
        kept.push(successor);
        kept.push(first);
        kept.reverse();
        self.samples = kept;
    }

    /// Picks the last sample whose highest possible rank stays within
    /// `(q + epsilon) * n`. The width bound on the sample after it keeps
    /// its lowest possible rank above `(q - epsilon) * n`.
    fn query_merged(&self, q: f64) -> f64 {
        // Quantiles that are not targets get no slack.
        let epsilon = self
            .targets
            .iter()
            .find(|(quantile, _)| *quantile == q)
            .map_or(0.0, |&(_, epsilon)| epsilon);
        let bound = (q + epsilon) * self.n;

        let mut previous = self.samples[0];
        let mut r = 0.0;
        for current in &self.samples[1..] {
            r += previous.width;
            if r + current.width + current.delta > bound {
                return previous.value;
            }
            previous = *current;
        }
        previous.value
    }
}
