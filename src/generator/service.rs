//! Simulated service responses.

use crate::rules::{ResponseStrategy, ServiceGenConfig, ServiceResponse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Picks responses for service invocations.
///
/// Holds no per-service state; the random source sits behind a mutex so a
/// shared generator can answer concurrent invocations.
pub struct ServiceResponseGenerator {
    rng: Mutex<StdRng>,
}

impl Default for ServiceResponseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceResponseGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    pub fn default_success() -> ServiceResponse {
        ServiceResponse::new(200, "ok", "success")
    }

    pub fn default_failure() -> ServiceResponse {
        ServiceResponse::new(500, "error", "failure")
    }

    pub fn respond(&self, config: &ServiceGenConfig) -> ServiceResponse {
        let candidates = &config.possible_responses;
        if candidates.is_empty() {
            return Self::default_success();
        }
        match config.response_strategy {
            ResponseStrategy::Fixed => candidates[0].clone(),
            ResponseStrategy::Random | ResponseStrategy::RandomPick => {
                let index = self.with_rng(|rng| rng.gen_range(0..candidates.len()));
                candidates[index].clone()
            }
            ResponseStrategy::Unknown(_) => Self::default_success(),
        }
    }

    /// Answers with success at roughly `success_rate`, otherwise with the
    /// first error candidate.
    pub fn respond_with_success_rate(
        &self,
        config: &ServiceGenConfig,
        success_rate: f64,
    ) -> ServiceResponse {
        let roll = self.with_rng(|rng| rng.gen::<f64>());
        if roll < success_rate {
            if let Some(success) = Self::success_responses(config).first() {
                return (*success).clone();
            }
        }
        Self::error_responses(config)
            .first()
            .map(|r| (*r).clone())
            .unwrap_or_else(Self::default_failure)
    }

    /// Candidates with a 2xx code.
    pub fn success_responses(config: &ServiceGenConfig) -> Vec<&ServiceResponse> {
        config
            .possible_responses
            .iter()
            .filter(|r| r.is_success())
            .collect()
    }

    /// Candidates with a non-2xx code.
    pub fn error_responses(config: &ServiceGenConfig) -> Vec<&ServiceResponse> {
        config
            .possible_responses
            .iter()
            .filter(|r| !r.is_success())
            .collect()
    }

    pub fn response_by_code(config: &ServiceGenConfig, code: i32) -> Option<&ServiceResponse> {
        config.possible_responses.iter().find(|r| r.code == code)
    }

    /// Fraction of candidates that are successes; 1.0 with no candidates.
    pub fn success_rate(config: &ServiceGenConfig) -> f64 {
        let total = config.possible_responses.len();
        if total == 0 {
            return 1.0;
        }
        Self::success_responses(config).len() as f64 / total as f64
    }

    /// Random processing latency in `[min, max]`.
    pub fn processing_delay(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_millis() as u64;
        let extra = self.with_rng(|rng| rng.gen_range(0..=span));
        min + Duration::from_millis(extra)
    }
}
