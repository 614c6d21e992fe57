//! Back-off schedule for connect retries.

use std::time::Duration;

use lp_domain::config::ReconnectConfig;

/// How long a node waits between failed connection attempts.
///
/// The delay grows by `backoff_factor` per attempt up to `max_delay`, then
/// up to `jitter` of it is added on top.  Retries themselves are unbounded;
/// see [`Node::connect`](crate::Node::connect) for the ways out.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectBackoff {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_factor: cfg.backoff_factor,
            jitter: cfg.jitter,
        }
    }
}

impl ReconnectBackoff {
    /// Reject settings that cannot produce a sane schedule.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(format!("backoff_factor must be >= 1.0, got {}", self.backoff_factor));
        }
        if !(self.jitter.is_finite() && (0.0..=1.0).contains(&self.jitter)) {
            return Err(format!("jitter must be between 0.0 and 1.0, got {}", self.jitter));
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".into());
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0 = after the first failure).
    ///
    /// `salt` spreads nodes that fail together across different delays;
    /// the same `(attempt, salt)` always yields the same delay.  Settings
    /// that [`validate`](Self::validate) would reject fall back to
    /// `max_delay` rather than panicking.
    pub fn delay(&self, attempt: u32, salt: u64) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        // f64 overflows to infinity long before 1024 doublings matter.
        let exponent = attempt.min(1024) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let base = if base.is_finite() && base >= 0.0 { base.min(cap) } else { cap };

        let ratio = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        let spread = base * ratio * unit_fraction(attempt, salt);
        Duration::try_from_secs_f64(base + spread).unwrap_or(self.max_delay)
    }
}

/// splitmix64 finalizer mapped onto `[0, 1)`.
fn unit_fraction(attempt: u32, salt: u64) -> f64 {
    let mut z = salt ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectBackoff {
        ReconnectBackoff {
            jitter: 0.0,
            ..ReconnectBackoff::default()
        }
    }

    #[test]
    fn doubles_from_one_second() {
        let p = no_jitter();
        assert_eq!(p.delay(0, 7), Duration::from_secs(1));
        assert_eq!(p.delay(1, 7), Duration::from_secs(2));
        assert_eq!(p.delay(5, 7), Duration::from_secs(32));
    }

    #[test]
    fn caps_at_max_delay() {
        let p = no_jitter();
        assert_eq!(p.delay(6, 0), Duration::from_secs(60));
        assert_eq!(p.delay(u32::MAX, 0), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let p = ReconnectBackoff::default();
        for attempt in 0..20 {
            for salt in [0, 1, 0xDEAD_BEEF, u64::MAX] {
                let d = p.delay(attempt, salt);
                let base = no_jitter().delay(attempt, salt);
                assert!(d >= base, "attempt {attempt}: {d:?} < {base:?}");
                assert!(d <= base.mul_f64(1.25), "attempt {attempt}: {d:?} too long");
            }
        }
    }

    #[test]
    fn salt_spreads_nodes_apart() {
        let p = ReconnectBackoff::default();
        let delays: std::collections::HashSet<Duration> =
            (0..8u64).map(|salt| p.delay(3, salt)).collect();
        assert!(delays.len() > 1);
        assert_eq!(p.delay(3, 5), p.delay(3, 5));
    }

    #[test]
    fn bad_settings_fall_back_to_max_delay() {
        let negative = ReconnectBackoff {
            backoff_factor: -2.0,
            ..no_jitter()
        };
        assert_eq!(negative.delay(1, 0), Duration::from_secs(60));
        assert_eq!(negative.delay(0, 0), Duration::from_secs(1));

        let nan = ReconnectBackoff {
            backoff_factor: f64::NAN,
            jitter: f64::NAN,
            ..ReconnectBackoff::default()
        };
        assert_eq!(nan.delay(3, 9), Duration::from_secs(60));

        let negative_jitter = ReconnectBackoff {
            jitter: -0.5,
            ..ReconnectBackoff::default()
        };
        assert_eq!(negative_jitter.delay(1, 9), Duration::from_secs(2));
    }

    #[test]
    fn unit_factor_with_huge_attempt_is_constant() {
        let p = ReconnectBackoff {
            backoff_factor: 1.0,
            ..no_jitter()
        };
        assert_eq!(p.delay(u32::MAX, 0), Duration::from_secs(1));
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        assert!(ReconnectBackoff::default().validate().is_ok());
        for bad in [
            ReconnectBackoff { backoff_factor: -2.0, ..ReconnectBackoff::default() },
            ReconnectBackoff { backoff_factor: 0.5, ..ReconnectBackoff::default() },
            ReconnectBackoff { backoff_factor: f64::NAN, ..ReconnectBackoff::default() },
            ReconnectBackoff { jitter: -0.1, ..ReconnectBackoff::default() },
            ReconnectBackoff { jitter: f64::INFINITY, ..ReconnectBackoff::default() },
            ReconnectBackoff {
                initial_delay: Duration::from_secs(120),
                ..ReconnectBackoff::default()
            },
        ] {
            assert!(bad.validate().is_err(), "{bad:?} passed validation");
        }
    }

    #[test]
    fn built_from_config() {
        let cfg = ReconnectConfig {
            initial_delay_ms: 50,
            max_delay_ms: 400,
            backoff_factor: 3.0,
            jitter: 0.1,
        };
        let p = ReconnectBackoff::from(&cfg);
        assert_eq!(p.initial_delay, Duration::from_millis(50));
        assert_eq!(p.max_delay, Duration::from_millis(400));
        assert_eq!(p.backoff_factor, 3.0);
        assert_eq!(p.jitter, 0.1);
    }
}
