//! Environment-variable-driven tuning, grounded on the teacher's
//! `watchdog.rs` (`SEQ_WATCHDOG_*`) env-var convention: parse-with-default,
//! never panic on a malformed value.

use std::env;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogAction {
    Warn,
    Exit,
}

#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub gc_interval: usize,
    pub max_registers: usize,
    pub fiber_registry_capacity: usize,
    pub watchdog_secs: u64,
    pub watchdog_interval_secs: u64,
    pub watchdog_action: WatchdogAction,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            gc_interval: 10_000,
            max_registers: 1 << 20,
            fiber_registry_capacity: 4096,
            watchdog_secs: 0,
            watchdog_interval_secs: 5,
            watchdog_action: WatchdogAction::Warn,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut cfg = RuntimeConfig::default();
        if let Some(v) = parse_env("LUMEN_GC_INTERVAL") {
            cfg.gc_interval = v;
        }
        if let Some(v) = parse_env("LUMEN_STACK_CAPACITY") {
            cfg.max_registers = v;
        }
        if let Some(v) = parse_env("LUMEN_FIBER_REGISTRY_SIZE") {
            cfg.fiber_registry_capacity = v;
        }
        if let Some(v) = parse_env("LUMEN_WATCHDOG_SECS") {
            cfg.watchdog_secs = v;
        }
        if let Some(v) = parse_env("LUMEN_WATCHDOG_INTERVAL") {
            if v > 0 {
                cfg.watchdog_interval_secs = v;
            }
        }
        cfg.watchdog_action = match env::var("LUMEN_WATCHDOG_ACTION").as_deref() {
            Ok("exit") => WatchdogAction::Exit,
            _ => WatchdogAction::Warn,
        };
        cfg
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_secs > 0
    }

    pub fn watchdog_threshold(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn malformed_value_falls_back_to_default() {
        unsafe { env::set_var("LUMEN_GC_INTERVAL", "not_a_number") };
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.gc_interval, RuntimeConfig::default().gc_interval);
        unsafe { env::remove_var("LUMEN_GC_INTERVAL") };
    }

    #[test]
    #[serial]
    fn watchdog_disabled_when_secs_unset() {
        unsafe { env::remove_var("LUMEN_WATCHDOG_SECS") };
        let cfg = RuntimeConfig::from_env();
        assert!(!cfg.watchdog_enabled());
    }

    #[test]
    #[serial]
    fn watchdog_action_exit_is_recognized() {
        unsafe { env::set_var("LUMEN_WATCHDOG_ACTION", "exit") };
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.watchdog_action, WatchdogAction::Exit);
        unsafe { env::remove_var("LUMEN_WATCHDOG_ACTION") };
    }
}
