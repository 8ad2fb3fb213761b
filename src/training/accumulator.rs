use std::collections::BTreeMap;

/// Simple running mean per loss name, reset at report boundaries.
#[derive(Clone, Debug, Default)]
pub struct RunningLosses {
    sums: BTreeMap<String, (f64, usize)>,
}

impl RunningLosses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, values: &BTreeMap<String, f64>) {
        for (name, value) in values {
            let entry = self.sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(name, (sum, count))| (name.clone(), sum / (*count).max(1) as f64))
            .collect()
    }

    /// Means so far, then start over.
    pub fn take(&mut self) -> BTreeMap<String, f64> {
        let means = self.means();
        self.sums.clear();
        means
    }
}

/// Tracks micro-steps of gradient accumulation.
///
/// Optimizers step once every `iter_size` micro-steps; the loss values of
/// one window are averaged into `<name>_avg` entries reported after the
/// last micro-step.
#[derive(Clone, Debug)]
pub struct IterCalculator {
    iter_size: usize,
    position: usize,
    window: RunningLosses,
    last_window: BTreeMap<String, f64>,
}

impl IterCalculator {
    pub fn new(iter_size: usize) -> Self {
        Self {
            iter_size: iter_size.max(1),
            position: 0,
            window: RunningLosses::new(),
            last_window: BTreeMap::new(),
        }
    }

    pub fn iter_size(&self) -> usize {
        self.iter_size
    }

    /// Whether the micro-step about to run is the last of its window.
    pub fn is_last(&self) -> bool {
        self.position + 1 == self.iter_size
    }

    /// Record the losses of a finished micro-step.
    pub fn finish(&mut self, values: &BTreeMap<String, f64>) {
        self.window.push(values);
        self.position += 1;
        if self.position == self.iter_size {
            self.last_window = self
                .window
                .take()
                .into_iter()
                .map(|(name, mean)| (format!("{name}_avg"), mean))
                .collect();
            self.position = 0;
        }
    }

    /// Averages of the last completed window.
    pub fn averages(&self) -> &BTreeMap<String, f64> {
        &self.last_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn losses(value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("G_tot".to_string(), value)])
    }

    #[test]
    fn running_means_reset_on_take() {
        let mut running = RunningLosses::new();
        running.push(&losses(1.0));
        running.push(&losses(3.0));
        assert_eq!(running.take()["G_tot"], 2.0);
        assert!(running.is_empty());
    }

    #[test]
    fn windows_close_every_iter_size_steps() {
        let mut iter = IterCalculator::new(3);
        let mut last = Vec::new();
        for value in [1.0, 2.0, 3.0, 4.0] {
            last.push(iter.is_last());
            iter.finish(&losses(value));
        }
        assert_eq!(last, vec![false, false, true, false]);
        assert_eq!(iter.averages()["G_tot_avg"], 2.0);
    }

    #[test]
    fn single_step_windows() {
        let mut iter = IterCalculator::new(0);
        assert_eq!(iter.iter_size(), 1);
        assert!(iter.is_last());
        iter.finish(&losses(5.0));
        assert!(iter.is_last());
        assert_eq!(iter.averages()["G_tot_avg"], 5.0);
    }
}
