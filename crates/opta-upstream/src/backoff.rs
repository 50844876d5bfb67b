use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries on the same host after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped, with ±jitter. A server-suggested delay
    /// wins but is still capped.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.max_delay);
        }

        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(10.0) as u64)
    }
}
