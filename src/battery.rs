//! # Battery-Aware Adaptation
//!
//! Advisory scheduling hints only (§5): nothing here may change LWW
//! outcomes, validation, or correctness — only *when* and *how much*
//! background work runs. [`BatterySource`] is a small capability trait
//! (§9's "dynamic dispatch as capability sets") with two concrete
//! variants: [`StubBatterySource`] for hosts and tests with no real
//! battery, and [`ChannelBatterySource`] for a platform binding (out of
//! scope) to push updates in over a channel rather than the adapter
//! holding an owning handle back into platform code (§9's cyclic-reference
//! guidance: message passing over a back-reference).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::BatteryConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub level_pct: u8,
    pub is_charging: bool,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self { level_pct: 100, is_charging: true }
    }
}

pub trait BatterySource: Send + Sync {
    fn current(&self) -> BatteryStatus;
}

/// Fixed reading, for hosts with no real battery and for tests.
pub struct StubBatterySource(BatteryStatus);

impl StubBatterySource {
    pub fn new(status: BatteryStatus) -> Self {
        Self(status)
    }
}

impl BatterySource for StubBatterySource {
    fn current(&self) -> BatteryStatus {
        self.0
    }
}

/// Fed by a platform binding pushing updates over an `mpsc` channel. The
/// sender half returned by [`Self::new`] is the only coupling back to the
/// platform; dropping it just freezes the last-known reading.
pub struct ChannelBatterySource {
    current: Arc<RwLock<BatteryStatus>>,
}

impl ChannelBatterySource {
    pub fn new(initial: BatteryStatus) -> (Self, mpsc::UnboundedSender<BatteryStatus>) {
        let current = Arc::new(RwLock::new(initial));
        let (tx, mut rx) = mpsc::unbounded_channel::<BatteryStatus>();
        let updater = current.clone();
        tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                *updater.write().unwrap() = status;
            }
        });
        (Self { current }, tx)
    }
}

impl BatterySource for ChannelBatterySource {
    fn current(&self) -> BatteryStatus {
        *self.current.read().unwrap()
    }
}

/// Applies [`BatteryConfig`] thresholds to a reading. Every method is a
/// pure query; none of them touch storage or the network.
pub struct BatteryAdapter {
    source: Arc<dyn BatterySource>,
    config: BatteryConfig,
}

impl BatteryAdapter {
    pub fn new(source: Arc<dyn BatterySource>, config: BatteryConfig) -> Self {
        Self { source, config }
    }

    fn status(&self) -> BatteryStatus {
        self.source.current()
    }

    /// Stretch the MQTT keepalive interval when battery is low.
    pub fn effective_keep_alive(&self, base: Duration) -> Duration {
        let s = self.status();
        if self.config.adaptive_keepalive && s.level_pct <= self.config.low_threshold {
            base.saturating_mul(2)
        } else {
            base
        }
    }

    /// `None` means anti-entropy should pause entirely (critical, not
    /// charging); `Some` carries the (possibly stretched) interval.
    pub fn effective_anti_entropy_interval(&self, base: Duration) -> Option<Duration> {
        let s = self.status();
        if !self.config.adaptive_sync_interval {
            return Some(base);
        }
        if s.level_pct <= self.config.critical_threshold && !s.is_charging {
            return None;
        }
        if s.level_pct <= self.config.low_threshold {
            return Some(base.saturating_mul(3));
        }
        Some(base)
    }

    /// Shrink the offline-queue batch size when battery is low.
    pub fn effective_batch_size(&self, base: usize) -> usize {
        let s = self.status();
        if self.config.reduce_background_activity && s.level_pct <= self.config.low_threshold {
            (base / 2).max(1)
        } else {
            base
        }
    }

    /// Whether Low-priority offline-queue items should be deferred.
    pub fn should_throttle_low_priority(&self) -> bool {
        let s = self.status();
        self.config.enable_operation_throttling && s.level_pct <= self.config.low_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(level_pct: u8, is_charging: bool) -> BatteryAdapter {
        let source = Arc::new(StubBatterySource::new(BatteryStatus { level_pct, is_charging }));
        BatteryAdapter::new(source, BatteryConfig::default())
    }

    #[test]
    fn healthy_battery_leaves_defaults_untouched() {
        let a = adapter(80, false);
        assert_eq!(a.effective_keep_alive(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(a.effective_anti_entropy_interval(Duration::from_secs(60)), Some(Duration::from_secs(60)));
        assert!(!a.should_throttle_low_priority());
    }

    #[test]
    fn low_battery_stretches_intervals_and_throttles() {
        let a = adapter(15, false);
        assert_eq!(a.effective_keep_alive(Duration::from_secs(60)), Duration::from_secs(120));
        assert_eq!(a.effective_anti_entropy_interval(Duration::from_secs(60)), Some(Duration::from_secs(180)));
        assert_eq!(a.effective_batch_size(50), 25);
        assert!(a.should_throttle_low_priority());
    }

    #[test]
    fn critical_and_not_charging_pauses_anti_entropy() {
        let a = adapter(5, false);
        assert_eq!(a.effective_anti_entropy_interval(Duration::from_secs(60)), None);
    }

    #[test]
    fn critical_but_charging_does_not_pause() {
        let a = adapter(5, true);
        assert!(a.effective_anti_entropy_interval(Duration::from_secs(60)).is_some());
    }
}
