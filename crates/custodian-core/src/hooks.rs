//! Runtime hook manager
//!
//! Event sources and the periodic safety timer only run while automation is
//! enabled and a target is configured.

use custodian_host_api::{EventSource, HostEvent, HostEventSender, HostResult};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name under which the safety timer is reported
pub const SAFETY_TIMER: &str = "safety-timer";

/// Emits [`HostEvent::SafetyTick`] at a fixed interval
#[derive(Debug)]
pub struct SafetyTimer {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl SafetyTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes effect on the next start
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

impl EventSource for SafetyTimer {
    fn name(&self) -> &str {
        SAFETY_TIMER
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(HostEvent::SafetyTick).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for SafetyTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Registered {
    source: Box<dyn EventSource>,
    running: bool,
}

/// Registry of event sources, switched together
pub struct HookManager {
    events: HostEventSender,
    safety: SafetyTimer,
    safety_running: bool,
    sources: Vec<Registered>,
}

impl HookManager {
    pub fn new(events: HostEventSender, safety_interval: Duration) -> Self {
        Self {
            events,
            safety: SafetyTimer::new(safety_interval),
            safety_running: false,
            sources: Vec::new(),
        }
    }

    /// Add a source. It starts on the next `refresh` that wants it running.
    pub fn register(&mut self, source: Box<dyn EventSource>) {
        debug!(source = source.name(), "Event source registered");
        self.sources.push(Registered {
            source,
            running: false,
        });
    }

    /// Restarts the safety timer if it is running
    pub fn set_safety_interval(&mut self, interval: Duration) {
        if self.safety.interval() == interval {
            return;
        }
        self.safety.set_interval(interval);
        if self.safety_running {
            switch(&mut self.safety, &mut self.safety_running, false, &self.events);
            switch(&mut self.safety, &mut self.safety_running, true, &self.events);
        }
    }

    /// Start everything if `active`, stop everything otherwise.
    ///
    /// Sources already in the requested state are left alone.
    pub fn refresh(&mut self, active: bool) {
        switch(&mut self.safety, &mut self.safety_running, active, &self.events);
        for entry in &mut self.sources {
            switch(entry.source.as_mut(), &mut entry.running, active, &self.events);
        }
    }

    pub fn stop_all(&mut self) {
        self.refresh(false);
    }

    /// Names of the sources currently running
    pub fn running(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if self.safety_running {
            names.push(SAFETY_TIMER);
        }
        names.extend(
            self.sources
                .iter()
                .filter(|e| e.running)
                .map(|e| e.source.name()),
        );
        names
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running().contains(&name)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len() + 1
    }
}

/// Start or stop one source. The running flag only changes on success.
fn switch(source: &mut dyn EventSource, running: &mut bool, active: bool, events: &HostEventSender) {
    if *running == active {
        return;
    }

    let result = if active {
        source.start(events.clone())
    } else {
        source.stop()
    };

    match result {
        Ok(()) => {
            *running = active;
            info!(
                source = source.name(),
                "Event source {}",
                if active { "started" } else { "stopped" }
            );
        }
        Err(e) => {
            warn!(
                source = source.name(),
                error = %e,
                "Event source failed to {}",
                if active { "start" } else { "stop" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_host_api::MockEventSource;
    use tokio::sync::mpsc;

    fn manager() -> (HookManager, MockEventSource, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hooks = HookManager::new(tx, Duration::from_secs(60));
        let source = MockEventSource::new("power");
        hooks.register(Box::new(source.clone()));
        (hooks, source, rx)
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let (mut hooks, source, _rx) = manager();

        hooks.refresh(true);
        hooks.refresh(true);
        assert_eq!(source.starts(), 1);
        assert!(hooks.is_running("power"));
        assert!(hooks.is_running(SAFETY_TIMER));

        hooks.refresh(false);
        hooks.refresh(false);
        assert_eq!(source.stops(), 1);
        assert!(hooks.running().is_empty());
    }

    #[tokio::test]
    async fn failed_start_keeps_source_stopped() {
        let (mut hooks, source, _rx) = manager();
        source.set_fail_start(true);

        hooks.refresh(true);
        assert!(!hooks.is_running("power"));

        // Retried on the next refresh
        source.set_fail_start(false);
        hooks.refresh(true);
        assert!(hooks.is_running("power"));
        assert_eq!(source.starts(), 2);
    }

    #[tokio::test]
    async fn failed_stop_keeps_source_running() {
        let (mut hooks, source, _rx) = manager();
        hooks.refresh(true);
        source.set_fail_stop(true);

        hooks.refresh(false);
        assert!(hooks.is_running("power"));
        assert!(!hooks.is_running(SAFETY_TIMER));
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timer_ticks_at_interval() {
        let (mut hooks, _source, mut rx) = manager();
        let start = tokio::time::Instant::now();
        hooks.refresh(true);

        assert_eq!(rx.recv().await, Some(HostEvent::SafetyTick));
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(rx.recv().await, Some(HostEvent::SafetyTick));
        assert_eq!(start.elapsed(), Duration::from_secs(120));

        hooks.stop_all();
        let next = tokio::time::timeout(Duration::from_secs(300), rx.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn sources_deliver_into_shared_channel() {
        let (mut hooks, source, mut rx) = manager();
        hooks.refresh(true);

        assert!(source.emit(HostEvent::PowerChanged));
        assert_eq!(rx.recv().await, Some(HostEvent::PowerChanged));
    }
}
