use crate::{config::PowerConfig, types::PowerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    EnterPowerSave,
    ExitPowerSave,
    EnterDeepSleep,
}

/// Inactivity tracker. Both thresholds are measured from the same
/// `last_activity_ms`.
#[derive(Debug, Clone)]
pub struct SleepMonitor {
    config: PowerConfig,
    enabled: bool,
    last_activity_ms: u64,
    state: PowerState,
}

impl SleepMonitor {
    pub fn new(config: PowerConfig, now_ms: u64) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(err) => {
                log::warn!("{err}; using default power timeouts");
                PowerConfig::default()
            }
        };

        Self {
            config,
            enabled: false,
            last_activity_ms: now_ms,
            state: PowerState::Normal,
        }
    }

    /// Starts the inactivity clock from `now_ms`.
    pub fn enable(&mut self, now_ms: u64) {
        if !self.enabled {
            log::info!(
                "sleep monitor enabled (power save after {}ms, deep sleep after {}ms)",
                self.config.power_save_timeout_ms,
                self.config.deep_sleep_timeout_ms
            );
        }
        self.enabled = true;
        self.last_activity_ms = now_ms;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn record_activity(&mut self, now_ms: u64) -> Option<PowerTransition> {
        self.last_activity_ms = now_ms;
        if self.state == PowerState::PowerSave {
            self.state = PowerState::Normal;
            return Some(PowerTransition::ExitPowerSave);
        }
        None
    }

    /// One monitor cycle. `activity` is the OR of every activity predicate.
    pub fn check_activity(&mut self, activity: bool, now_ms: u64) -> Option<PowerTransition> {
        if !self.enabled || self.state == PowerState::DeepSleep {
            return None;
        }

        if activity {
            return self.record_activity(now_ms);
        }

        let idle_ms = now_ms.saturating_sub(self.last_activity_ms);
        if idle_ms >= self.config.deep_sleep_timeout_ms {
            self.state = PowerState::DeepSleep;
            return Some(PowerTransition::EnterDeepSleep);
        }

        if idle_ms >= self.config.power_save_timeout_ms && self.state == PowerState::Normal {
            self.state = PowerState::PowerSave;
            return Some(PowerTransition::EnterPowerSave);
        }

        None
    }

    /// Explicit deep-sleep request. Ignored while disabled.
    pub fn request_deep_sleep(&mut self) -> Option<PowerTransition> {
        if !self.enabled || self.state == PowerState::DeepSleep {
            return None;
        }
        self.state = PowerState::DeepSleep;
        Some(PowerTransition::EnterDeepSleep)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn enabled_at(now_ms: u64) -> SleepMonitor {
        let mut monitor = SleepMonitor::new(PowerConfig::default(), 0);
        monitor.enable(now_ms);
        monitor
    }

    #[test]
    fn disabled_monitor_never_transitions() {
        let mut monitor = SleepMonitor::new(PowerConfig::default(), 0);

        assert_eq!(monitor.check_activity(false, 10_000_000), None);
        assert_eq!(monitor.request_deep_sleep(), None);
        assert_eq!(monitor.state(), PowerState::Normal);
    }

    #[test]
    fn no_power_save_before_timeout() {
        let mut monitor = enabled_at(0);
        monitor.check_activity(true, 1_000);

        assert_eq!(monitor.check_activity(false, 30_999), None);
        assert_eq!(
            monitor.check_activity(false, 31_000),
            Some(PowerTransition::EnterPowerSave)
        );
        assert_eq!(monitor.check_activity(false, 31_500), None);
    }

    #[test]
    fn no_deep_sleep_before_timeout() {
        let mut monitor = enabled_at(5_000);

        monitor.check_activity(false, 40_000);
        assert_eq!(monitor.check_activity(false, 3_604_999), None);
        assert_eq!(
            monitor.check_activity(false, 3_605_000),
            Some(PowerTransition::EnterDeepSleep)
        );
        assert_eq!(monitor.state(), PowerState::DeepSleep);
        assert_eq!(monitor.check_activity(true, 3_606_000), None);
    }

    #[test]
    fn activity_in_power_save_restores_normal() {
        let mut monitor = enabled_at(0);
        monitor.check_activity(false, 30_000);
        assert_eq!(monitor.state(), PowerState::PowerSave);

        assert_eq!(
            monitor.check_activity(true, 45_000),
            Some(PowerTransition::ExitPowerSave)
        );
        assert_eq!(monitor.state(), PowerState::Normal);
        assert_eq!(monitor.last_activity_ms(), 45_000);
        assert_eq!(monitor.check_activity(false, 74_999), None);
    }

    #[test]
    fn out_of_order_timeouts_fall_back_to_defaults() {
        let config = PowerConfig {
            power_save_timeout_ms: 10_000,
            deep_sleep_timeout_ms: 5_000,
        };
        let mut monitor = SleepMonitor::new(config, 0);
        monitor.enable(0);

        assert_eq!(monitor.check_activity(false, 9_000), None);
    }
}
