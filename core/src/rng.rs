//! Deterministic random number generation.
//!
//! RULE: No engine may call any platform RNG.
//! All randomness flows through EngineRng instances derived
//! from the single master seed in the schedule config.
//!
//! Each consumer gets its own stream, seeded deterministically
//! from (master_seed XOR slot) and, for bandit experiments, from a
//! stable hash of the experiment id. This means:
//!   - Registering a new experiment never changes another experiment's stream.
//!   - Each stream is fully reproducible in isolation.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for a single consumer.
pub struct EngineRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl EngineRng {
    pub fn new(master_seed: u64, stream: u64) -> Self {
        let derived_seed = master_seed ^ (stream.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Sample from a simplified Pareto distribution.
    pub fn pareto(&mut self, x_min: f64, alpha: f64) -> f64 {
        let u = self.next_f64().max(1e-10);
        x_min * u.powf(-1.0 / alpha)
    }

    /// Standard normal draw (Box–Muller, cosine branch only).
    pub fn standard_normal(&mut self) -> f64 {
        // 1 - u keeps the log argument in (0, 1].
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    /// Gamma(shape, 1) draw via Marsaglia–Tsang.
    pub fn gamma(&mut self, shape: f64) -> f64 {
        assert!(shape > 0.0, "gamma shape must be > 0");
        if shape < 1.0 {
            // Boost: Gamma(a) = Gamma(a + 1) * U^(1/a)
            let u = (1.0 - self.next_f64()).max(f64::MIN_POSITIVE);
            return self.gamma(shape + 1.0) * u.powf(1.0 / shape);
        }

        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        loop {
            let x = self.standard_normal();
            let v = 1.0 + c * x;
            if v <= 0.0 {
                continue;
            }
            let v = v * v * v;
            let u = self.next_f64();
            if u < 1.0 - 0.0331 * x.powi(4) {
                return d * v;
            }
            if u > 0.0 && u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
                return d * v;
            }
        }
    }

    /// Beta(alpha, beta) draw as X / (X + Y) with X ~ Gamma(alpha), Y ~ Gamma(beta).
    pub fn beta(&mut self, alpha: f64, beta: f64) -> f64 {
        let x = self.gamma(alpha);
        let y = self.gamma(beta);
        if x + y <= 0.0 {
            return 0.5;
        }
        x / (x + y)
    }
}

/// All engine RNGs for a single deployment, indexed by stable slot.
#[derive(Debug, Clone, Copy)]
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn for_slot(&self, slot: EngineSlot) -> EngineRng {
        EngineRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }

    /// Stream for one bandit experiment. Stable across restarts for the
    /// same (seed, experiment_id) pair.
    pub fn for_experiment(&self, experiment_id: &str) -> EngineRng {
        let stream = (EngineSlot::Bandit as u64) ^ stable_hash(experiment_id);
        EngineRng::new(self.master_seed, stream).with_name(EngineSlot::Bandit.name())
    }
}

/// Stable slot assignments.
/// NEVER reorder or remove entries. Only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum EngineSlot {
    Bandit = 0,
    DemoData = 1,
}

impl EngineSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bandit => "bandit",
            Self::DemoData => "demo_data",
        }
    }
}

/// FNV-1a. `DefaultHasher` output is not guaranteed stable across releases.
fn stable_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
