//! Per-connection karma: a reputation score that throttles raw byte reads.
//!
//! Karma sits below the XML layer. Every read is charged against an
//! allowance derived from the current score, and a periodic heartbeat
//! both raises the score and pays down the byte meter. A connection whose
//! score drops to zero or below is penalized: the multiplexer stops reading
//! from it until heartbeats lift the score back above zero, at which point
//! the score snaps to `restore`.

use std::time::{Duration, Instant};

use crate::XmppError;

/// Bytes of read allowance granted per point of karma.
pub const READ_ALLOWANCE_PER_POINT: u64 = 100;

/// Read allowance for a karma value.
pub fn allowance(val: i32) -> u64 {
    u64::from(val.unsigned_abs()) * READ_ALLOWANCE_PER_POINT
}

/// Karma tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KarmaConfig {
    /// Starting value for a new connection.
    pub init: i32,
    /// Upper bound.
    pub max: i32,
    /// Added on each heartbeat.
    pub inc: i32,
    /// Subtracted when a read overruns the allowance.
    pub dec: i32,
    /// Value assigned when karma hits zero; also the lower bound.
    pub penalty: i32,
    /// Value assigned when a penalty period ends.
    pub restore: i32,
    /// Clear the byte meter when a penalty period ends.
    pub reset_meter: bool,
    /// Minimum time between heartbeat updates.
    pub heartbeat: Duration,
}

impl Default for KarmaConfig {
    fn default() -> Self {
        Self {
            init: 5,
            max: 10,
            inc: 1,
            dec: 0,
            penalty: -5,
            restore: 5,
            reset_meter: false,
            heartbeat: Duration::from_secs(2),
        }
    }
}

impl KarmaConfig {
    /// Check that the values describe a usable karma range.
    pub fn validate(&self) -> Result<(), XmppError> {
        if self.penalty > 0 {
            return Err(XmppError::config(format!(
                "karma penalty must be <= 0, got {}",
                self.penalty
            )));
        }
        if self.restore <= 0 || self.restore > self.max {
            return Err(XmppError::config(format!(
                "karma restore must be in 1..={}, got {}",
                self.max, self.restore
            )));
        }
        if self.init < self.penalty || self.init > self.max {
            return Err(XmppError::config(format!(
                "karma init must be in {}..={}, got {}",
                self.penalty, self.max, self.init
            )));
        }
        if self.inc < 0 || self.dec < 0 {
            return Err(XmppError::config("karma inc and dec must be non-negative"));
        }
        if self.heartbeat.is_zero() {
            return Err(XmppError::config("karma heartbeat must be non-zero"));
        }
        Ok(())
    }
}

/// Karma state for one connection.
#[derive(Debug, Clone)]
pub struct Karma {
    config: KarmaConfig,
    val: i32,
    bytes: u64,
    last_update: Option<Instant>,
}

impl Karma {
    /// Fresh karma at `config.init`.
    pub fn new(config: KarmaConfig) -> Self {
        Self {
            config,
            val: config.init,
            bytes: 0,
            last_update: None,
        }
    }

    /// Current karma value.
    pub fn value(&self) -> i32 {
        self.val
    }

    /// Bytes read since the meter was last paid down.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The configuration this state was created with.
    pub fn config(&self) -> &KarmaConfig {
        &self.config
    }

    /// `true` while reads should be suspended.
    pub fn is_bad(&self) -> bool {
        self.val <= 0
    }

    /// Heartbeat at the current time.
    pub fn heartbeat(&mut self) {
        self.heartbeat_at(Instant::now());
    }

    /// Raise karma if a full heartbeat interval has passed since the last
    /// update; otherwise do nothing.
    pub fn heartbeat_at(&mut self, now: Instant) {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.config.heartbeat {
                return;
            }
        }

        let was_penalized = self.val <= 0;
        self.val = self.val.saturating_add(self.config.inc).min(self.config.max);

        if was_penalized && self.val > 0 {
            self.val = self.config.restore;
            if self.config.reset_meter {
                self.bytes = 0;
            }
        }

        if self.val > 0 {
            self.bytes = self.bytes.saturating_sub(allowance(self.val));
        }

        self.last_update = Some(now);
    }

    /// Charge `n` bytes against the allowance.
    pub fn record_read(&mut self, n: usize) {
        self.bytes = self.bytes.saturating_add(n as u64);
        if self.bytes > allowance(self.val) {
            self.val = self.val.saturating_sub(self.config.dec);
            if self.val <= 0 {
                self.val = self.config.penalty;
            }
        }
    }

    /// Heartbeat, then charge `n` bytes. Returns `true` for bad karma.
    pub fn check(&mut self, n: usize) -> bool {
        self.check_at(n, Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock.
    pub fn check_at(&mut self, n: usize, now: Instant) -> bool {
        self.heartbeat_at(now);
        self.record_read(n);
        self.is_bad()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> KarmaConfig {
        KarmaConfig {
            init: 5,
            max: 10,
            inc: 1,
            dec: 1,
            penalty: -5,
            restore: 5,
            reset_meter: false,
            heartbeat: Duration::from_secs(2),
        }
    }

    fn beat(k: &mut Karma, at: &mut Instant) {
        *at += k.config().heartbeat;
        k.heartbeat_at(*at);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(KarmaConfig::default().validate().is_ok());
        assert!(strict().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad = [
            KarmaConfig { penalty: 1, ..strict() },
            KarmaConfig { restore: 0, ..strict() },
            KarmaConfig { restore: 11, ..strict() },
            KarmaConfig { init: 11, ..strict() },
            KarmaConfig { inc: -1, ..strict() },
            KarmaConfig { heartbeat: Duration::ZERO, ..strict() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?} should be rejected");
        }
    }

    #[test]
    fn test_overrun_at_lowest_penalty_saturates() {
        let config = KarmaConfig {
            init: 1,
            dec: i32::MAX,
            penalty: i32::MIN,
            ..strict()
        };
        assert!(config.validate().is_ok());
        let mut k = Karma::new(config);

        k.record_read(1_000);
        assert_eq!(k.value(), i32::MIN);

        k.record_read(usize::MAX);
        assert_eq!(k.value(), i32::MIN);
        assert!(k.is_bad());
    }

    #[test]
    fn test_overrun_decrements_then_penalizes() {
        let mut k = Karma::new(strict());
        let mut now = Instant::now();

        // First check runs a heartbeat: 5 -> 6, allowance 600.
        assert!(!k.check_at(601, now));
        assert_eq!(k.value(), 5);

        // Keep flooding within the same heartbeat window.
        for expected in (1..5).rev() {
            now += Duration::from_millis(10);
            assert!(!k.check_at(1, now));
            assert_eq!(k.value(), expected);
        }

        now += Duration::from_millis(10);
        assert!(k.check_at(1, now));
        assert_eq!(k.value(), -5);
    }

    #[test]
    fn test_penalty_lifts_to_restore_after_heartbeats() {
        let mut k = Karma::new(KarmaConfig { init: -5, ..strict() });
        let mut now = Instant::now();
        k.heartbeat_at(now);
        assert_eq!(k.value(), -4);

        // -4 -> 0 takes four more beats, all still bad.
        for _ in 0..4 {
            beat(&mut k, &mut now);
            assert!(k.is_bad());
        }
        assert_eq!(k.value(), 0);

        beat(&mut k, &mut now);
        assert_eq!(k.value(), 5);
        assert!(!k.is_bad());
    }

    #[test]
    fn test_heartbeat_ignored_within_interval() {
        let mut k = Karma::new(strict());
        let now = Instant::now();
        k.heartbeat_at(now);
        assert_eq!(k.value(), 6);

        k.heartbeat_at(now + Duration::from_secs(1));
        assert_eq!(k.value(), 6);

        k.heartbeat_at(now + Duration::from_secs(2));
        assert_eq!(k.value(), 7);
    }

    #[test]
    fn test_heartbeat_pays_down_meter() {
        let mut k = Karma::new(strict());
        let now = Instant::now();
        k.heartbeat_at(now);
        k.record_read(500);
        assert_eq!(k.bytes(), 500);

        // val 7 pays down 700 bytes, floored at zero.
        k.heartbeat_at(now + Duration::from_secs(2));
        assert_eq!(k.bytes(), 0);
    }

    #[test]
    fn test_reset_meter_on_restore() {
        let cfg = KarmaConfig {
            init: 0,
            dec: 0,
            penalty: 0,
            ..strict()
        };
        let now = Instant::now();

        let mut kept = Karma::new(cfg);
        kept.record_read(50_000);
        kept.heartbeat_at(now);
        assert_eq!(kept.value(), 5);
        assert_eq!(kept.bytes(), 49_500);

        let mut cleared = Karma::new(KarmaConfig {
            reset_meter: true,
            ..cfg
        });
        cleared.record_read(50_000);
        cleared.heartbeat_at(now);
        assert_eq!(cleared.value(), 5);
        assert_eq!(cleared.bytes(), 0);
    }

    #[test]
    fn test_value_stays_within_bounds() {
        let cfg = strict();
        let mut k = Karma::new(cfg);
        let mut now = Instant::now();

        // Deterministic mix of reads and beats.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            match seed % 3 {
                0 => beat(&mut k, &mut now),
                1 => {
                    k.check_at((seed % 2_000) as usize, now);
                }
                _ => k.record_read((seed % 300) as usize),
            }
            assert!(
                (cfg.penalty..=cfg.max).contains(&k.value()),
                "karma {} escaped bounds",
                k.value()
            );
        }
    }
}
