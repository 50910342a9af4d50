//! Fault-tag monitor.
//!
//! Polls the controller's boolean fault tag and fires the fault response once
//! per rising edge:
//!
//! ```text
//! AwaitingBaseline --(read false)--> Armed --(read true)--> Triggered
//!        ^  |                          ^                        |
//!        +--+ (read true; ack)         +---(read false)--- Cooldown <+
//! ```
//!
//! A tag that is already asserted at startup is drained, never recorded: the
//! buffers hold no pre-fault footage for it. After a save the monitor stays in
//! `Cooldown` until it reads the tag false, so a condition that stays asserted
//! can never produce a second save.
//!
//! A lost controller link stops the monitor immediately. Single tag read or
//! write failures are retried with exponential backoff, up to
//! `RetryPolicy::max_retries`, before they become fatal too.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::controller::{Controller, ControllerError, TagResult};

/// Longest uninterrupted sleep; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    AwaitingBaseline,
    Armed,
    Triggered,
    Cooldown,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::AwaitingBaseline => "awaiting-baseline",
            MonitorState::Armed => "armed",
            MonitorState::Triggered => "triggered",
            MonitorState::Cooldown => "cooldown",
        };
        f.write_str(name)
    }
}

/// One observation of the fault tag. Lives for a single poll.
#[derive(Clone, Copy, Debug)]
pub struct FaultEvent {
    pub raw_value: bool,
    pub observed_at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. Zero makes every tag error fatal.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub fault_tag: String,
    pub poll_interval: Duration,
    /// Write the fault tag back to false after handling a fault.
    pub acknowledge: bool,
    pub retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("controller failure: {0}")]
    Controller(#[from] ControllerError),
}

/// What the monitor does on a rising edge.
pub trait FaultResponder {
    fn on_fault(&mut self, controller: &mut dyn Controller);
}

impl<F: FnMut(&mut dyn Controller)> FaultResponder for F {
    fn on_fault(&mut self, controller: &mut dyn Controller) {
        self(controller)
    }
}

pub struct FaultMonitor<C> {
    controller: C,
    settings: MonitorSettings,
    state: MonitorState,
    shutdown: Arc<AtomicBool>,
    faults_handled: u64,
    polls: u64,
}

impl<C: Controller> FaultMonitor<C> {
    pub fn new(controller: C, settings: MonitorSettings, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            controller,
            settings,
            state: MonitorState::AwaitingBaseline,
            shutdown,
            faults_handled: 0,
            polls: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn faults_handled(&self) -> u64 {
        self.faults_handled
    }

    /// Poll until shutdown is requested or the controller fails for good.
    pub fn run(&mut self, responder: &mut dyn FaultResponder) -> Result<(), MonitorError> {
        log::info!(
            "monitoring tag {} every {:?} (acknowledge: {})",
            self.settings.fault_tag,
            self.settings.poll_interval,
            self.settings.acknowledge
        );
        while !self.shutdown_requested() {
            self.step(responder)?;
            self.pause(self.settings.poll_interval);
        }
        log::info!("monitor stopping in state {}", self.state);
        Ok(())
    }

    /// One poll: read the tag once and apply the resulting transition. A
    /// rising edge runs the whole fault response inside this call.
    pub fn step(
        &mut self,
        responder: &mut dyn FaultResponder,
    ) -> Result<MonitorState, MonitorError> {
        let event = self.poll()?;

        match self.state {
            MonitorState::AwaitingBaseline if event.raw_value => {
                log::debug!("fault tag asserted at startup, waiting for it to clear");
                if self.settings.acknowledge {
                    self.acknowledge()?;
                }
            }
            MonitorState::AwaitingBaseline => {
                log::info!("fault tag clear, monitor armed");
                self.state = MonitorState::Armed;
            }
            MonitorState::Armed if event.raw_value => {
                self.state = MonitorState::Triggered;
                self.handle_fault(event, responder)?;
            }
            MonitorState::Armed => {}
            // `Triggered` never outlives `handle_fault`.
            MonitorState::Cooldown | MonitorState::Triggered if !event.raw_value => {
                log::info!("fault cleared, monitor re-armed");
                self.state = MonitorState::Armed;
            }
            MonitorState::Cooldown | MonitorState::Triggered => {}
        }
        Ok(self.state)
    }

    fn handle_fault(
        &mut self,
        event: FaultEvent,
        responder: &mut dyn FaultResponder,
    ) -> Result<(), MonitorError> {
        log::info!(
            "fault detected on {} at {}",
            self.settings.fault_tag,
            event.observed_at.format("%Y-%m-%d %H:%M:%S")
        );
        let started = Instant::now();
        responder.on_fault(&mut self.controller);
        self.faults_handled += 1;
        self.state = MonitorState::Cooldown;
        log::info!("fault handled in {:?}", started.elapsed());

        if self.settings.acknowledge {
            self.acknowledge()?;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<FaultEvent, MonitorError> {
        let tag = self.settings.fault_tag.clone();
        let raw_value = self.with_retry("read", &tag, |c| c.read_bool(&tag))?;
        if self.polls == 0 {
            log::info!("connected to controller, {} = {}", tag, raw_value);
        }
        self.polls += 1;
        Ok(FaultEvent {
            raw_value,
            observed_at: Local::now(),
        })
    }

    fn acknowledge(&mut self) -> Result<(), MonitorError> {
        let tag = self.settings.fault_tag.clone();
        self.with_retry("acknowledge", &tag, |c| c.write_bool(&tag, false))
    }

    fn with_retry<T>(
        &mut self,
        what: &str,
        tag: &str,
        mut op: impl FnMut(&mut C) -> TagResult<T>,
    ) -> Result<T, MonitorError> {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            match op(&mut self.controller) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => {
                    log::error!("{} of {} failed: {}", what, tag, e);
                    return Err(e.into());
                }
                Err(e) if attempt >= retry.max_retries || self.shutdown_requested() => {
                    log::error!(
                        "{} of {} failed after {} attempt(s): {}",
                        what,
                        tag,
                        attempt + 1,
                        e
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    log::warn!(
                        "{} of {} failed: {}; retry {}/{} in {:?}",
                        what,
                        tag,
                        e,
                        attempt,
                        retry.max_retries,
                        delay
                    );
                    self.pause(delay);
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.shutdown_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
