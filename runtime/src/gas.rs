//! Gas accounting.
//!
//! A [`GasMeter`] is created per request and owned by its execution
//! context. Explicit charges come from host bindings; time-based units
//! accrue from the watchdog tick. Both paths are atomic so the tick
//! thread never blocks on a lock, and `used` is monotone by construction:
//! charges only `fetch_add`, time accrual only `fetch_max`.
//!
//! Once `used > limit` the meter latches into lockout; every later charge
//! fails and the interpreter is stopped at its next interruption point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::GasConfig;
use crate::error::OutOfGas;

/// Cost table for host-side operations, derived from [`GasConfig`].
#[derive(Debug, Clone, Copy)]
pub struct GasCosts {
    pub basic_op: u64,
    pub memory_per_byte: f64,
    pub storage_per_byte: f64,
    pub crypto_op: u64,
    pub timer_arm: u64,
    pub timer_fire: u64,
}

impl GasCosts {
    pub fn from_config(config: &GasConfig) -> Self {
        Self {
            basic_op: config.basic_op_gas,
            memory_per_byte: config.memory_gas_per_byte,
            storage_per_byte: config.storage_gas_per_byte,
            crypto_op: config.crypto_op_gas,
            timer_arm: config.timer_arm_gas,
            timer_fire: config.timer_fire_gas,
        }
    }

    /// Cost of moving `bytes` through interpreter memory.
    pub fn memory(&self, bytes: usize) -> u64 {
        (bytes as f64 * self.memory_per_byte).ceil() as u64
    }

    /// Cost of moving `bytes` through storage.
    pub fn storage(&self, bytes: usize) -> u64 {
        (bytes as f64 * self.storage_per_byte).ceil() as u64
    }

    /// Cost of producing `n` random bytes.
    pub fn random(&self, n: u32) -> u64 {
        20 + n as u64
    }
}

/// Per-request gas meter.
pub struct GasMeter {
    limit: u64,
    charged: AtomicU64,
    time_accrued: AtomicU64,
    locked_out: AtomicBool,
    start: Instant,
    /// Units per millisecond of wall time; zero disables time accrual.
    time_rate: u64,
}

impl GasMeter {
    pub fn new(limit: u64, time_rate: u64) -> Self {
        Self {
            limit,
            charged: AtomicU64::new(0),
            time_accrued: AtomicU64::new(0),
            locked_out: AtomicBool::new(false),
            start: Instant::now(),
            time_rate,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Total units consumed so far. Monotone non-decreasing.
    pub fn used(&self) -> u64 {
        self.charged
            .load(Ordering::Acquire)
            .saturating_add(self.time_accrued.load(Ordering::Acquire))
    }

    pub fn locked_out(&self) -> bool {
        self.locked_out.load(Ordering::Acquire)
    }

    /// Latch the meter shut. Used for external cancellation; idempotent.
    pub fn lock_out(&self) {
        self.locked_out.store(true, Ordering::Release);
    }

    /// Charge `units` against the budget.
    pub fn charge(&self, units: u64) -> Result<(), OutOfGas> {
        if self.locked_out() {
            return Err(OutOfGas {
                used: self.used(),
                limit: self.limit,
            });
        }
        self.charged.fetch_add(units, Ordering::AcqRel);
        let used = self.used();
        if used > self.limit {
            self.lock_out();
            return Err(OutOfGas {
                used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Fold wall time into the meter. Called from the watchdog tick and
    /// from `used()` observers; never decreases the accrued component.
    /// Latches lockout when the budget is exceeded.
    pub fn accrue_time(&self) {
        if self.time_rate == 0 {
            return;
        }
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let accrued = elapsed_ms.saturating_mul(self.time_rate);
        self.time_accrued.fetch_max(accrued, Ordering::AcqRel);
        if self.used() > self.limit {
            self.lock_out();
        }
    }

    /// Elapsed wall time since the meter was armed, in milliseconds.
    pub fn wall_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Rearm between requests. Meters are per-request so this is only
    /// useful for embedders that pool them.
    pub fn reset(&mut self) {
        self.charged.store(0, Ordering::Release);
        self.time_accrued.store(0, Ordering::Release);
        self.locked_out.store(false, Ordering::Release);
        self.start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charges_accumulate() {
        let meter = GasMeter::new(100, 0);
        meter.charge(10).unwrap();
        meter.charge(20).unwrap();
        assert_eq!(meter.used(), 30);
        assert!(!meter.locked_out());
    }

    #[test]
    fn exceeding_the_limit_locks_out() {
        let meter = GasMeter::new(100, 0);
        meter.charge(100).unwrap();
        let err = meter.charge(1).unwrap_err();
        assert_eq!(err.limit, 100);
        assert!(err.used > 100);
        assert!(meter.locked_out());

        // Latched: even a free charge fails now.
        assert!(meter.charge(0).is_err());
    }

    #[test]
    fn used_is_monotone() {
        let meter = GasMeter::new(1_000_000, 1);
        let mut last = 0;
        for _ in 0..50 {
            meter.charge(3).unwrap();
            meter.accrue_time();
            let used = meter.used();
            assert!(used >= last);
            last = used;
        }
    }

    #[test]
    fn identical_charge_sequences_agree() {
        let a = GasMeter::new(10_000, 0);
        let b = GasMeter::new(10_000, 0);
        for units in [1, 50, 20, 7, 50] {
            a.charge(units).unwrap();
            b.charge(units).unwrap();
        }
        assert_eq!(a.used(), b.used());
    }

    #[test]
    fn time_accrual_locks_out_eventually() {
        let meter = GasMeter::new(5, 1_000_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        meter.accrue_time();
        assert!(meter.locked_out());
    }

    #[test]
    fn external_lockout_is_idempotent() {
        let meter = GasMeter::new(100, 0);
        meter.lock_out();
        meter.lock_out();
        assert!(meter.charge(1).is_err());
    }

    #[test]
    fn reset_rearms_the_meter() {
        let mut meter = GasMeter::new(10, 0);
        meter.charge(10).unwrap();
        assert!(meter.charge(1).is_err());
        meter.reset();
        assert_eq!(meter.used(), 0);
        assert!(meter.charge(5).is_ok());
    }

    #[test]
    fn cost_table_rounds_fractions_up() {
        let costs = GasCosts::from_config(&crate::config::GasConfig::default());
        assert_eq!(costs.memory(0), 0);
        assert_eq!(costs.memory(1), 1); // 0.1 rounds up
        assert_eq!(costs.memory(10), 1);
        assert_eq!(costs.memory(11), 2);
        assert_eq!(costs.storage(100), 100);
        assert_eq!(costs.random(12), 32);
    }
}
