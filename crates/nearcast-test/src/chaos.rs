//! Lossy link simulation
//!
//! Decides, per transmission, whether an invite or a payload makes it across
//! a link. Loss can be random or come in bursts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Link loss configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Independent loss rate (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability that a transmission starts a loss burst
    pub burst_loss_prob: f64,
    /// Burst length range, in transmissions
    pub burst_length: (u32, u32),
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::perfect()
    }
}

impl ChaosConfig {
    /// Nothing is lost
    pub fn perfect() -> Self {
        ChaosConfig {
            loss_rate: 0.0,
            burst_loss_prob: 0.0,
            burst_length: (0, 0),
        }
    }

    /// Peers at the edge of radio range
    pub fn lossy() -> Self {
        ChaosConfig {
            loss_rate: 0.1,
            burst_loss_prob: 0.05,
            burst_length: (1, 3),
        }
    }

    /// Crowded spectrum
    pub fn hostile() -> Self {
        ChaosConfig {
            loss_rate: 0.3,
            burst_loss_prob: 0.2,
            burst_length: (2, 6),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
}

impl ChaosStats {
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }
}

/// One direction of a radio link
pub struct ChaosLink {
    config: ChaosConfig,
    rng: StdRng,
    burst_remaining: u32,
    stats: ChaosStats,
}

impl ChaosLink {
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        ChaosLink {
            config,
            rng: StdRng::seed_from_u64(seed),
            burst_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// Returns true if the transmission arrives
    pub fn transmit(&mut self) -> bool {
        self.stats.sent += 1;
        if self.should_drop() {
            self.stats.lost += 1;
            false
        } else {
            self.stats.delivered += 1;
            true
        }
    }

    fn should_drop(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            return true;
        }

        if self.config.burst_loss_prob > 0.0 && self.rng.gen::<f64>() < self.config.burst_loss_prob
        {
            let (min, max) = self.config.burst_length;
            // This transmission is the first of the burst
            self.burst_remaining = self.rng.gen_range(min..=max).saturating_sub(1);
            return true;
        }

        self.config.loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.loss_rate
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }
}
