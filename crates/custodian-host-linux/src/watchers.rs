//! Polling event sources
//!
//! Each source samples something on an interval and reports when the value
//! changes. None of them evaluate anything; they only notify.

use async_trait::async_trait;
use custodian_api::{PowerSource, TargetIdentity};
use custodian_host_api::{EventSource, HostEvent, HostEventSender, HostResult, ProcessIdentity};
use nix::time::{clock_gettime, ClockId};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connectivity::ReachabilityProbe;
use crate::power::read_power_source;
use crate::process::ProcessControl;

/// Something that can be sampled periodically
#[async_trait]
pub trait Sampler: Send + Sync + 'static {
    type Value: PartialEq + Debug + Send + 'static;

    async fn sample(&self) -> Self::Value;
}

/// Power source from sysfs; `None` when unreadable
#[derive(Debug, Clone)]
pub struct PowerSampler {
    root: PathBuf,
}

impl PowerSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Sampler for PowerSampler {
    type Value = Option<PowerSource>;

    async fn sample(&self) -> Self::Value {
        read_power_source(&self.root).ok()
    }
}

#[async_trait]
impl Sampler for ReachabilityProbe {
    type Value = Option<bool>;

    async fn sample(&self) -> Self::Value {
        self.check().await
    }
}

/// Emits `event` whenever the sampled value differs from the previous one.
///
/// The first sample after start only establishes a baseline.
pub struct ChangePoller<S: Sampler> {
    name: &'static str,
    sampler: Arc<S>,
    interval: Duration,
    event: HostEvent,
    task: Option<JoinHandle<()>>,
}

impl<S: Sampler> ChangePoller<S> {
    pub fn new(name: &'static str, sampler: S, interval: Duration, event: HostEvent) -> Self {
        Self {
            name,
            sampler: Arc::new(sampler),
            interval,
            event,
            task: None,
        }
    }
}

impl<S: Sampler> EventSource for ChangePoller<S> {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        self.stop()?;

        let sampler = self.sampler.clone();
        let interval = self.interval;
        let event = self.event.clone();
        let name = self.name;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut last: Option<S::Value> = None;
            loop {
                ticker.tick().await;
                let value = sampler.sample().await;

                if let Some(previous) = &last {
                    if *previous != value {
                        debug!(source = name, from = ?previous, to = ?value, "Sampled value changed");
                        if events.send(event.clone()).is_err() {
                            break;
                        }
                    }
                }
                last = Some(value);
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

impl<S: Sampler> Drop for ChangePoller<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Reports launches and exits of the target.
///
/// Follows target changes through a watch channel; a change resets the
/// baseline without emitting anything.
pub struct ProcessWatcher {
    control: ProcessControl,
    target: watch::Receiver<Option<TargetIdentity>>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl ProcessWatcher {
    pub fn new(
        control: ProcessControl,
        target: watch::Receiver<Option<TargetIdentity>>,
        interval: Duration,
    ) -> Self {
        Self {
            control,
            target,
            interval,
            task: None,
        }
    }
}

/// What changed between two observations of the target
pub fn process_transition(
    previous: Option<(&str, ProcessIdentity)>,
    current: Option<(&str, ProcessIdentity)>,
) -> Vec<HostEvent> {
    match (previous, current) {
        (None, None) => Vec::new(),
        (None, Some((name, id))) => vec![HostEvent::ProcessLaunched {
            name: name.to_string(),
            pid: id.pid,
        }],
        (Some((name, id)), None) => vec![HostEvent::ProcessTerminated {
            name: name.to_string(),
            pid: id.pid,
        }],
        (Some((old_name, old)), Some((new_name, new))) if old != new => vec![
            HostEvent::ProcessTerminated {
                name: old_name.to_string(),
                pid: old.pid,
            },
            HostEvent::ProcessLaunched {
                name: new_name.to_string(),
                pid: new.pid,
            },
        ],
        _ => Vec::new(),
    }
}

impl EventSource for ProcessWatcher {
    fn name(&self) -> &str {
        "process-watcher"
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        self.stop()?;

        let control = self.control.clone();
        let mut target_rx = self.target.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut seen: Option<(String, ProcessIdentity)> = None;
            let mut baseline = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = target_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        seen = None;
                        baseline = true;
                        continue;
                    }
                }

                let target = target_rx.borrow().clone();
                let Some(target) = target else {
                    seen = None;
                    continue;
                };

                let current = match control.find_running(&target).await {
                    Ok(found) => found.map(|h| (h.name.clone(), h.identity())),
                    Err(e) => {
                        debug!(error = %e, "Process scan failed");
                        continue;
                    }
                };

                if !baseline {
                    let transitions = process_transition(
                        seen.as_ref().map(|(n, id)| (n.as_str(), *id)),
                        current.as_ref().map(|(n, id)| (n.as_str(), *id)),
                    );
                    for event in transitions {
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                baseline = false;
                seen = current;
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

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Time spent suspended between two clock readings.
///
/// `CLOCK_BOOTTIME` keeps counting through suspend; `CLOCK_MONOTONIC` does
/// not. Gaps up to `tolerance` are scheduling noise.
pub fn suspended_for(
    before: (Duration, Duration),
    after: (Duration, Duration),
    tolerance: Duration,
) -> Option<Duration> {
    let boot = after.0.checked_sub(before.0)?;
    let mono = after.1.checked_sub(before.1)?;
    boot.checked_sub(mono).filter(|gap| *gap > tolerance)
}

fn read_clocks() -> Option<(Duration, Duration)> {
    let boot = clock_gettime(ClockId::CLOCK_BOOTTIME).ok()?;
    let mono = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
    Some((Duration::from(boot), Duration::from(mono)))
}

/// Reports [`HostEvent::SystemWoke`] after a suspend
pub struct WakeDetector {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl WakeDetector {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }
}

impl EventSource for WakeDetector {
    fn name(&self) -> &str {
        "wake-detector"
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        self.stop()?;

        let interval = self.interval;
        let tolerance = Duration::from_secs(2).max(interval / 2);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = read_clocks();
            if last.is_none() {
                warn!("Boot clock unavailable; wake detection disabled");
                return;
            }

            loop {
                ticker.tick().await;
                let now = read_clocks();
                if let (Some(before), Some(after)) = (last, now) {
                    if let Some(gap) = suspended_for(before, after, tolerance) {
                        info!(suspended_secs = gap.as_secs(), "System woke from suspend");
                        if events.send(HostEvent::SystemWoke).is_err() {
                            break;
                        }
                    }
                }
                last = now;
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

impl Drop for WakeDetector {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct Counter(AtomicU32);

    #[async_trait]
    impl Sampler for Counter {
        type Value = u32;

        // Changes every other sample
        async fn sample(&self) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst) / 2
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_reports_changes_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = ChangePoller::new(
            "counter",
            Counter(AtomicU32::new(0)),
            Duration::from_secs(1),
            HostEvent::PowerChanged,
        );
        poller.start(tx).unwrap();

        // Samples 0,0,1,1,2: changes at the third and fifth
        tokio::time::sleep(Duration::from_millis(4500)).await;
        poller.stop().unwrap();

        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event, HostEvent::PowerChanged);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn transitions() {
        let a = ProcessIdentity::new(10, 100);
        let b = ProcessIdentity::new(10, 200);

        assert!(process_transition(None, None).is_empty());
        assert!(process_transition(Some(("agent", a)), Some(("agent", a))).is_empty());
        assert_eq!(
            process_transition(None, Some(("agent", a))),
            vec![HostEvent::ProcessLaunched { name: "agent".into(), pid: 10 }]
        );
        assert_eq!(
            process_transition(Some(("agent", a)), None),
            vec![HostEvent::ProcessTerminated { name: "agent".into(), pid: 10 }]
        );
        // PID reuse shows up as exit plus launch
        assert_eq!(process_transition(Some(("agent", a)), Some(("agent", b))).len(), 2);
    }

    #[test]
    fn suspend_detection() {
        let secs = Duration::from_secs;
        let tolerance = secs(2);

        assert_eq!(suspended_for((secs(100), secs(90)), (secs(105), secs(95)), tolerance), None);
        assert_eq!(
            suspended_for((secs(100), secs(90)), (secs(705), secs(95)), tolerance),
            Some(secs(600))
        );
        assert_eq!(suspended_for((secs(100), secs(90)), (secs(50), secs(95)), tolerance), None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut detector = WakeDetector::new(Duration::from_secs(5));
        let (tx, _rx) = mpsc::unbounded_channel();
        detector.start(tx).unwrap();
        detector.stop().unwrap();
        detector.stop().unwrap();
    }
}
