//! Start/Test/Stop workflow orchestration.
//!
//! One run drives one (BIB, UUT, port) triple: reserve a port, optionally
//! wait for the bench's power-on-ready line, open a protocol session, walk
//! the three phases applying the continue policy, and always run the Stop
//! phase for cleanup once a session was opened. Every underlying failure is
//! folded into the returned [`WorkflowResult`]; nothing escapes as an
//! error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::bib::{BibConfiguration, Phase, PortConfig};
use crate::config::watcher::WorkflowTrigger;
use crate::context::SupervisorContext;
use crate::gpio::{InputEvent, INPUT_POWER_DOWN_HEADS_UP};
use crate::pool::reservation::ReservationCriteria;
use crate::protocol::{ProtocolError, ProtocolRequest, ProtocolResponse};
use crate::validation::{deciding_rule, evaluate, ValidationLevel, ValidationOutcome};

/// How often the power-on-ready gate re-samples the input.
const POWER_POLL: Duration = Duration::from_millis(50);

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// All phases ran to completion.
    Completed,
    /// A phase result stopped the workflow at the given level.
    ValidationStop(ValidationLevel),
    /// The (UUT, port) pair is not present in the BIB configuration.
    ConfigMissing,
    /// No eligible port could be reserved.
    NoPortAvailable,
    /// The protocol session could not be opened.
    SessionOpenFailed,
    /// The power-on-ready input stayed deasserted past its timeout.
    PowerOnReadyTimeout,
    /// The bench asserted power-down-heads-up during the run.
    PowerDownRequested,
    /// The run was cancelled from outside (or its reservation expired).
    Cancelled,
}

/// Result of one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    /// The phase's command was sent and its response validated.
    Completed {
        /// The exchange's response, absent when it timed out.
        response: Option<ProtocolResponse>,
        /// Validation outcome deciding the phase level.
        outcome: ValidationOutcome,
    },
    /// The phase was skipped because of an earlier stop decision.
    Skipped,
}

/// One phase's record in a [`WorkflowResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    /// Which phase.
    pub phase: Phase,
    /// What happened.
    pub status: PhaseStatus,
}

impl PhaseResult {
    /// The level of a completed phase.
    pub fn level(&self) -> Option<ValidationLevel> {
        match &self.status {
            PhaseStatus::Completed { outcome, .. } => Some(outcome.level),
            PhaseStatus::Skipped => None,
        }
    }
}

/// The outcome of one (BIB, UUT, port) run.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// BIB the run belonged to.
    pub bib_id: String,
    /// UUT within the BIB.
    pub uut_id: String,
    /// Port number within the UUT.
    pub port_number: u32,
    /// Physical port the pool granted, once one was reserved.
    pub port_name: Option<String>,
    /// Protocol session id, once a session was opened.
    pub session_id: Option<String>,
    /// Worst level across completed phases.
    pub aggregate: ValidationLevel,
    /// Per-phase records in execution order.
    pub phases: Vec<PhaseResult>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Why the run ended.
    pub stop_reason: StopReason,
}

impl WorkflowResult {
    fn new(bib_id: &str, uut_id: &str, port_number: u32) -> Self {
        Self {
            bib_id: bib_id.to_owned(),
            uut_id: uut_id.to_owned(),
            port_number,
            port_name: None,
            session_id: None,
            aggregate: ValidationLevel::Pass,
            phases: Vec::new(),
            duration: Duration::ZERO,
            stop_reason: StopReason::Completed,
        }
    }

    /// The record of one phase.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    fn finish_failed(mut self, reason: StopReason, started: Instant) -> Self {
        self.aggregate = ValidationLevel::Fail;
        self.stop_reason = reason;
        self.duration = started.elapsed();
        self
    }
}

/// Executes workflows against a shared [`SupervisorContext`].
pub struct WorkflowEngine {
    ctx: Arc<SupervisorContext>,
}

impl WorkflowEngine {
    /// Creates an engine over the context.
    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        Self { ctx }
    }

    /// Runs workflows for every trigger arriving on `triggers` until the
    /// channel closes or `cancel` fires. Used with the watcher's
    /// auto-execute mode.
    pub async fn serve_triggers(
        &self,
        mut triggers: mpsc::UnboundedReceiver<WorkflowTrigger>,
        cancel: CancellationToken,
    ) -> Vec<WorkflowResult> {
        let mut results = Vec::new();
        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            let Some(bib) = self.ctx.registry.get(&trigger.bib_id) else {
                tracing::warn!(bib = %trigger.bib_id, "trigger for unregistered BIB");
                continue;
            };
            results.push(
                self.run(bib, &trigger.uut_id, trigger.port_number, cancel.child_token())
                    .await,
            );
        }
        results
    }

    /// Runs one (BIB, UUT, port) workflow.
    #[tracing::instrument(skip_all, fields(bib = %bib.id, uut = uut_id, port = port_number))]
    pub async fn run(
        &self,
        bib: Arc<BibConfiguration>,
        uut_id: &str,
        port_number: u32,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let started = Instant::now();
        let mut result = WorkflowResult::new(&bib.id, uut_id, port_number);

        let Some(port_config) = bib.port(uut_id, port_number).cloned() else {
            tracing::warn!("no such UUT/port in the BIB configuration");
            return result.finish_failed(StopReason::ConfigMissing, started);
        };

        // 1. Reserve a port.
        let criteria = ReservationCriteria::new(format!("workflow:{}:{uut_id}", bib.id))
            .with_validation(self.ctx.validation.clone());
        let reservation = match self.ctx.reservations.reserve(&criteria) {
            Ok(reservation) => reservation,
            Err(e) => {
                tracing::warn!("no port available: {e}");
                return result.finish_failed(StopReason::NoPortAvailable, started);
            }
        };
        self.ctx
            .reservations
            .attach_cancellation(&reservation.reservation_id, cancel.clone());
        let port_name = reservation.allocation.port_name.clone();
        result.port_name = Some(port_name.clone());

        let release = |result: WorkflowResult| {
            self.ctx
                .reservations
                .release(&reservation.reservation_id, &criteria.client_id);
            result
        };

        // 2. Power-on-ready gate.
        if port_config.workflow.wait_for_power_on_ready {
            let ready = self
                .wait_power_on_ready(port_config.workflow.power_on_ready_timeout, &cancel)
                .await;
            if !ready {
                tracing::warn!("power-on-ready timeout");
                return release(result.finish_failed(StopReason::PowerOnReadyTimeout, started));
            }
        }

        // 3. Open the protocol session.
        let mut handler = match self.ctx.protocols.create(&port_config.protocol) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!("protocol not available: {e}");
                return release(result.finish_failed(StopReason::SessionOpenFailed, started));
            }
        };
        let open_config = port_config.clone();
        let open_port = port_name.clone();
        let (returned, opened) = tokio::task::spawn_blocking(move || {
            let opened = handler.open(&open_port, &open_config);
            (handler, opened)
        })
        .await
        .expect("session open task panicked");
        handler = returned;
        match opened {
            Ok(session) => result.session_id = Some(session.session_id),
            Err(e) => {
                tracing::error!("session open failed: {e}");
                return release(result.finish_failed(StopReason::SessionOpenFailed, started));
            }
        }

        // Power-down monitoring for the lifetime of the session.
        let power_down = Arc::new(AtomicBool::new(false));
        let io_cancel = cancel.child_token();
        let monitor = tokio::spawn(monitor_power_down(
            self.ctx.gpio_events.subscribe(),
            io_cancel.clone(),
            Arc::clone(&power_down),
        ));

        // 4. Phases.
        let strict = self.ctx.validation.strict;
        let mut validation_stop: Option<ValidationLevel> = None;
        for phase in Phase::SEQUENCE {
            let is_stop_phase = phase == Phase::Stop;
            let interrupted = power_down.load(Ordering::SeqCst) || cancel.is_cancelled();
            if (validation_stop.is_some() || interrupted) && !is_stop_phase {
                result.phases.push(PhaseResult {
                    phase,
                    status: PhaseStatus::Skipped,
                });
                continue;
            }

            // The Stop phase always gets a live token so cleanup is
            // attempted even after cancellation or power-down.
            let phase_cancel = if is_stop_phase {
                CancellationToken::new()
            } else {
                io_cancel.clone()
            };

            let command = port_config.command(phase).clone();
            let request = ProtocolRequest::from(&command);
            let (returned, sent) = tokio::task::spawn_blocking(move || {
                let sent = handler.send(&request, &phase_cancel);
                (handler, sent)
            })
            .await
            .expect("phase send task panicked");
            handler = returned;

            let (response, outcome) = match sent {
                Ok(response) => {
                    let outcome = evaluate(&command.rules, &response.text);
                    (Some(response), outcome)
                }
                Err(ProtocolError::ProtocolTimeout) => {
                    // A timeout is Fail unless the phase defines a Critical
                    // pattern that matches the empty response.
                    let empty = evaluate(&command.rules, "");
                    let outcome = if empty.level == ValidationLevel::Critical {
                        empty
                    } else {
                        ValidationOutcome::fail(
                            "response timeout",
                            vec!["timeout".to_owned()],
                        )
                    };
                    (None, outcome)
                }
                Err(ProtocolError::Cancelled) => {
                    result.phases.push(PhaseResult {
                        phase,
                        status: PhaseStatus::Skipped,
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%phase, "phase I/O failed: {e}");
                    (
                        None,
                        ValidationOutcome::fail(
                            format!("protocol error: {e}"),
                            vec!["protocol_error".to_owned()],
                        ),
                    )
                }
            };

            let mut outcome = outcome;
            let matched_rule = deciding_rule(
                &command.rules,
                response.as_ref().map(|r| r.text.as_str()).unwrap_or(""),
            );

            // Stop-phase cleanup failures never escalate past Warn.
            if is_stop_phase && outcome.level == ValidationLevel::Fail {
                outcome.level = ValidationLevel::Warn;
                outcome.score = ValidationLevel::Warn.score();
            }
            let level = outcome.level;

            if level == ValidationLevel::Critical {
                let trigger_hardware = matched_rule.is_some_and(|r| r.trigger_hardware);
                if trigger_hardware {
                    let gpio = Arc::clone(&self.ctx.gpio);
                    let driven = tokio::task::spawn_blocking(move || {
                        gpio.set_critical_fail_signal(true)
                    })
                    .await
                    .expect("gpio task panicked");
                    if let Err(e) = driven {
                        tracing::error!("failed to raise critical fail signal: {e}");
                    } else {
                        tracing::warn!(%phase, "critical fail signal raised");
                    }
                }
            }

            tracing::info!(%phase, %level, "phase complete");
            result.phases.push(PhaseResult {
                phase,
                status: PhaseStatus::Completed { response, outcome },
            });

            if !is_stop_phase {
                let proceed = self.continue_policy(
                    level,
                    &port_config,
                    matched_rule.and_then(|r| r.stop_workflow),
                    matched_rule.and_then(|r| r.continue_on_failure),
                    command.continue_on_failure,
                    strict,
                );
                if !proceed && validation_stop.is_none() {
                    validation_stop = Some(level);
                }
            }
        }

        // 5. Close the session and release the reservation.
        let (returned, closed) = tokio::task::spawn_blocking(move || {
            let closed = handler.close();
            (handler, closed)
        })
        .await
        .expect("session close task panicked");
        drop(returned);
        if let Err(e) = closed {
            tracing::warn!("session close failed: {e}");
        }
        monitor.abort();

        result.stop_reason = if power_down.load(Ordering::SeqCst) {
            StopReason::PowerDownRequested
        } else if cancel.is_cancelled() {
            StopReason::Cancelled
        } else if let Some(level) = validation_stop {
            StopReason::ValidationStop(level)
        } else {
            StopReason::Completed
        };

        result.aggregate = result
            .phases
            .iter()
            .filter_map(PhaseResult::level)
            .max()
            .unwrap_or(ValidationLevel::Pass);
        result.duration = started.elapsed();
        release(result)
    }

    /// Whether the workflow proceeds past a non-Stop phase at `level`.
    ///
    /// Rule-level overrides win over the phase knob, which wins over the
    /// port-wide default. Critical always stops in strict mode; the
    /// `continue_on_critical` knob is honored only outside it.
    fn continue_policy(
        &self,
        level: ValidationLevel,
        port_config: &PortConfig,
        rule_stop_workflow: Option<bool>,
        rule_continue_on_failure: Option<bool>,
        phase_continue_on_failure: bool,
        strict: bool,
    ) -> bool {
        match level {
            ValidationLevel::Pass => true,
            ValidationLevel::Warn => {
                if rule_stop_workflow == Some(true) {
                    tracing::warn!("WARN rule requests workflow stop");
                    return false;
                }
                tracing::warn!("phase ended at WARN, continuing");
                true
            }
            ValidationLevel::Fail => {
                if let Some(stop) = rule_stop_workflow {
                    return !stop;
                }
                rule_continue_on_failure.unwrap_or(
                    phase_continue_on_failure || port_config.workflow.continue_on_failure,
                )
            }
            ValidationLevel::Critical => {
                if port_config.workflow.continue_on_critical {
                    if strict {
                        tracing::warn!(
                            "continue_on_critical is refused in strict mode; stopping"
                        );
                        return false;
                    }
                    tracing::warn!("continuing past CRITICAL per configuration");
                    return true;
                }
                false
            }
        }
    }

    /// Waits for the power-on-ready input, polling at a fixed cadence.
    async fn wait_power_on_ready(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let gpio = Arc::clone(&self.ctx.gpio);
            let ready = tokio::task::spawn_blocking(move || gpio.read_power_on_ready())
                .await
                .expect("gpio task panicked");
            match ready {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("power-on-ready read failed: {e}");
                    return false;
                }
            }
            if Instant::now() >= deadline || cancel.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(POWER_POLL) => {}
            }
        }
    }
}

/// Watches the GPIO event stream for an asserted power-down-heads-up and
/// cancels in-flight I/O when it arrives.
async fn monitor_power_down(
    mut events: broadcast::Receiver<InputEvent>,
    io_cancel: CancellationToken,
    power_down: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.name == INPUT_POWER_DOWN_HEADS_UP && event.value => {
                tracing::warn!("power-down requested by the bench");
                power_down.store(true, Ordering::SeqCst);
                io_cancel.cancel();
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
