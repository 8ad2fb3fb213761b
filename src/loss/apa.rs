use burn::config::Config;

/// Adaptive pseudo augmentation settings.
#[derive(Config, Debug)]
pub struct ApaConfig {
    #[config(default = false)]
    pub enabled: bool,
    /// Overfitting level the controller steers towards.
    #[config(default = 0.6)]
    pub target: f64,
    /// Initial substitution probability.
    #[config(default = 0.0)]
    pub initial_p: f64,
    /// Adjustment cadence in training steps.
    #[config(default = 4)]
    pub every: usize,
    /// Images it takes for `p` to move by one unit.
    #[config(default = 50)]
    pub nimg: usize,
}

/// Controller state for one discriminator.
///
/// Scores are collected between adjustments; on every `every`-th step the
/// mean real/fake gap is compared against `target` and `p` moves by
/// `sign * batch_size / nimg`, clamped to `[0, 1]`.
#[derive(Clone, Debug)]
pub struct ApaState {
    p: f64,
    target: f64,
    every: usize,
    nimg: usize,
    batch_size: usize,
    adjust: f64,
    real_sum: f64,
    fake_sum: f64,
    observations: usize,
}

impl ApaState {
    pub fn new(config: &ApaConfig, batch_size: usize) -> Self {
        Self {
            p: config.initial_p.clamp(0.0, 1.0),
            target: config.target,
            every: config.every.max(1),
            nimg: config.nimg.max(1),
            batch_size,
            adjust: 0.0,
            real_sum: 0.0,
            fake_sum: 0.0,
            observations: 0,
        }
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// Last signed increment applied to `p`.
    pub fn adjust(&self) -> f64 {
        self.adjust
    }

    pub fn is_due(&self, step: usize) -> bool {
        step % self.every == 0
    }

    /// Record mean discriminator responses on real and on buffered fakes.
    pub fn observe(&mut self, real_score: f64, fake_score: f64) {
        if !real_score.is_finite() || !fake_score.is_finite() {
            return;
        }
        self.real_sum += real_score;
        self.fake_sum += fake_score;
        self.observations += 1;
    }

    /// Adjust `p` from the collected scores when `step` hits the cadence.
    pub fn update(&mut self, step: usize) {
        if !self.is_due(step) || self.observations == 0 {
            return;
        }
        let count = self.observations as f64;
        let gap = self.real_sum / count - self.fake_sum / count;
        self.apply_signal(sign(gap - self.target));
        self.real_sum = 0.0;
        self.fake_sum = 0.0;
        self.observations = 0;
    }

    /// Move `p` by one step in the direction of `signal`.
    pub fn apply_signal(&mut self, signal: f64) {
        self.adjust = sign(signal) * self.batch_size as f64 / self.nimg as f64;
        self.p = (self.p + self.adjust).clamp(0.0, 1.0);
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}
