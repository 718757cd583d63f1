use std::sync::Arc;
use std::time::Duration;

use live_stream::{StreamMonitor, TriggerType};

/// Asks the monitor to re-evaluate liveness after an attempt ends
#[derive(Clone)]
pub struct RetryScheduler {
    monitor: Arc<dyn StreamMonitor>,
    delay: Duration,
}

impl RetryScheduler {
    pub fn new(monitor: Arc<dyn StreamMonitor>, delay: Duration) -> Self {
        Self { monitor, delay }
    }

    /// Schedule a recheck after the configured retry delay
    pub fn schedule_recheck(&self) {
        self.monitor.check(TriggerType::HttpApiRecheck, Some(self.delay));
    }

    /// Ask for an immediate check
    pub fn check_now(&self, trigger: TriggerType) {
        self.monitor.check(trigger, None);
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
