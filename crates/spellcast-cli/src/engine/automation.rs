//! The perception -> resolver -> effector loop.
//!
//! Each tick reads the mode and strategy once, so a hotkey or reload that
//! lands mid-tick applies from the next tick on. The cancellation token is
//! checked at every tick boundary and interrupts every wait. A keystroke
//! already being sent is allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use spellcast_core::detection::{labels, ready_skills, Region};
use spellcast_core::events::{DebugStep, StepDecision, Telemetry};
use spellcast_core::mode::Mode;
use spellcast_core::resolver::{resolve, Cast};
use spellcast_core::strategy::Strategy;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::channels::{LogSink, TelemetrySink};
use crate::engine::effector::{Effector, EffectorError};
use crate::engine::perception::Perception;

/// Wait between ticks that did nothing.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// Wait after a failed tick.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Stand-in deadline for waits too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + wait`, saturating at [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(from: Instant, wait: Duration) -> Instant {
    from.checked_add(wait)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

enum Tick {
    Idle,
    /// A key was sent; rest for the strategy's cooldown.
    Cast(Duration),
}

/// Operator confirmation for each resolved cast.
struct DebugGate {
    commands: mpsc::Receiver<StepDecision>,
    pending: watch::Sender<Option<DebugStep>>,
}

impl DebugGate {
    /// Announce `cast` and wait for a decision. `None` means stop was
    /// requested while waiting.
    async fn confirm(
        &mut self,
        cast: &Cast,
        log: &LogSink,
        telemetry: &TelemetrySink,
        cancel: &CancellationToken,
    ) -> Option<StepDecision> {
        // A decision only counts for the step it answers
        while let Ok(stale) = self.commands.try_recv() {
            debug!("Discarding step decision sent before a step was pending: {}", stale);
        }

        // Answerable before anyone hears about it
        let step = DebugStep::from(cast);
        self.pending.send_replace(Some(step.clone()));
        log.info(format!(
            "[debug] Paused, ready to cast: {} (key: {})",
            step.spell, step.keybind
        ));
        telemetry.publish(Telemetry::DebugStep(step));

        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            // Every controller gone: nobody can confirm, so never cast
            received = self.commands.recv() => Some(received.unwrap_or(StepDecision::Skip)),
        };
        self.pending.send_replace(None);

        if let Some(decision) = decision {
            log.info(format!("[debug] Command: {}", decision));
        }
        decision
    }
}

/// One automation loop. Consumed by [`AutomationLoop::run`].
pub struct AutomationLoop<P, E> {
    perception: P,
    effector: E,
    mode: watch::Receiver<Mode>,
    strategy: watch::Receiver<Arc<Strategy>>,
    region: Option<Region>,
    debug: Option<DebugGate>,
    log: LogSink,
    telemetry: TelemetrySink,
    cancel: CancellationToken,
    last_cast: Option<Instant>,
}

impl<P: Perception, E: Effector> AutomationLoop<P, E> {
    pub fn new(
        perception: P,
        effector: E,
        mode: watch::Receiver<Mode>,
        strategy: watch::Receiver<Arc<Strategy>>,
        log: LogSink,
        telemetry: TelemetrySink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            perception,
            effector,
            mode,
            strategy,
            region: None,
            debug: None,
            log,
            telemetry,
            cancel,
            last_cast: None,
        }
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    /// Require an `execute` decision before every keystroke.
    pub fn with_debug(
        mut self,
        commands: mpsc::Receiver<StepDecision>,
        pending: watch::Sender<Option<DebugStep>>,
    ) -> Self {
        self.debug = Some(DebugGate { commands, pending });
        self
    }

    /// Run until cancelled. Tick failures are logged and backed off, never
    /// returned.
    pub async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            let pause = match self.tick().await {
                Ok(Tick::Idle) => IDLE_POLL,
                Ok(Tick::Cast(cooldown)) => cooldown,
                Err(e) => {
                    self.log.error(format!("Automation loop error: {}", e));
                    ERROR_BACKOFF
                }
            };
            if !self.pause(pause).await {
                break;
            }
        }
        debug!("Automation loop stopped");
    }

    async fn tick(&mut self) -> Result<Tick, EffectorError> {
        let mode = *self.mode.borrow();
        let strategy = self.strategy.borrow().clone();
        if !mode.is_casting() || strategy.is_empty() {
            return Ok(Tick::Idle);
        }

        let detections = self.perception.detect(self.region).await;
        let ready = ready_skills(&detections);
        self.telemetry.publish(Telemetry::Detections {
            labels: labels(&detections),
        });
        if ready.is_empty() {
            return Ok(Tick::Idle);
        }

        let Some(cast) = resolve(&ready, mode, &strategy) else {
            return Ok(Tick::Idle);
        };

        match self.debug.as_mut() {
            Some(gate) => {
                match gate
                    .confirm(&cast, &self.log, &self.telemetry, &self.cancel)
                    .await
                {
                    Some(StepDecision::Execute) => {}
                    Some(StepDecision::Skip) | None => return Ok(Tick::Idle),
                }
            }
            None => self
                .log
                .info(format!("Mode: {} | Casting: {}", mode.label(), cast.spell)),
        }

        // Keep the gap from the previous keystroke even after a backoff or
        // a confirmation that came back quickly
        let cooldown = strategy.cooldown();
        if let Some(last) = self.last_cast {
            if !self.pause_until(deadline_after(last, cooldown)).await {
                return Ok(Tick::Idle);
            }
        }

        self.last_cast = Some(Instant::now());
        self.effector.send(&cast.keybind).await?;
        Ok(Tick::Cast(cooldown))
    }

    /// Sleep unless cancelled first. Returns false when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        self.pause_until(deadline_after(Instant::now(), duration)).await
    }

    async fn pause_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }
}
