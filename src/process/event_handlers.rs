use super::run::Reporter;
use super::types::{
    Controls, FaultSpec, Phase, ProcessSignal, Reply, Timer, TlsConfig, WantedState,
};
use super::{Notification, Outcome, Supervisor, SupervisorState};
use crate::error::SupervisorError;
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exit code recorded for an injected crash.
const FAULT_EXIT_CODE: i32 = -1;

impl Supervisor {
    pub(super) async fn handle_control(&mut self, control: Controls) {
        match control {
            Controls::Start(reply) => {
                let outcome = self.start().await;
                let _ = reply.send(outcome);
            }
            Controls::Stop { forced, reply } => self.stop(forced, reply),
            Controls::Restart { forced, reply } => self.restart(forced, reply).await,
            Controls::ExpectUpdate(reply) => match self.phase.state() {
                state @ SupervisorState::Updated => {
                    let _ = reply.send(Ok(state));
                }
                state @ (SupervisorState::Stopped
                | SupervisorState::Error
                | SupervisorState::Unrecoverable) => {
                    debug!(%state, "No update can complete from here");
                    let _ = reply.send(Err(SupervisorError::UpdateAbandoned(state)));
                }
                _ => self.update.expect(reply, self.config.update_timeout),
            },
            Controls::InjectFault { fault, reply } => {
                let outcome = self.inject_fault(fault).await;
                let _ = reply.send(outcome);
            }
            Controls::SetStatus(status, reply) => {
                if status != self.status {
                    self.status = status;
                    self.publish(false);
                    let _ = self
                        .notifications
                        .send(Notification::Status(self.status.clone()));
                }
                let _ = reply.send(Ok(self.phase.state()));
            }
        }
    }

    pub(super) async fn handle_process_signal(&mut self, epoch: u64, signal: ProcessSignal) {
        if self.handle.as_ref().map(|handle| handle.epoch) != Some(epoch) {
            debug!(epoch, ?signal, "Ignoring signal from a retired node");
            return;
        }
        match signal {
            ProcessSignal::Ready(tls) => self.on_ready(tls),
            ProcessSignal::NotReady => match self.phase {
                Phase::Starting { .. } | Phase::Updating { relaunched: true } => {
                    self.retire_handle();
                    self.on_startup_failed().await;
                }
                _ => debug!("Late readiness timeout ignored"),
            },
            ProcessSignal::Exited(exit_code) => {
                if let Some(handle) = self.handle.take() {
                    debug!(
                        "Node ran for {}",
                        humantime::format_duration(handle.started_at.elapsed())
                    );
                }
                self.on_exit(exit_code).await;
            }
            ProcessSignal::UpdateSignalled => match self.phase {
                Phase::Running => self.set_phase(Phase::Updating { relaunched: false }),
                _ => debug!(state = %self.phase.state(), "Update signal ignored"),
            },
        }
    }

    pub(super) async fn handle_timeout(&mut self, timer: Timer, epoch: u64) {
        match timer {
            Timer::UpdateWait => self.update.time_out(epoch),
            Timer::Phase if epoch != self.epoch => debug!(epoch, "Stale timer"),
            Timer::Phase => match self.phase {
                Phase::Crashed { .. } if self.wanted == WantedState::Running => {
                    if let Err(err) = self.launch(Phase::Starting { recovering: true }).await {
                        warn!(%err, "Restart after crash failed");
                    }
                }
                Phase::Stopping(_) => self.on_stop_timeout(),
                _ => debug!(state = %self.phase.state(), "Timer fired without work"),
            },
        }
    }

    async fn start(&mut self) -> Outcome {
        let state = self.phase.state();
        match self.phase {
            Phase::Stopped | Phase::Crashed { .. } | Phase::Unrecoverable | Phase::Error => {
                self.wanted = WantedState::Running;
                self.attempts = 0;
                self.launch(Phase::Starting { recovering: false }).await?;
                Ok(self.phase.state())
            }
            Phase::Starting { .. } | Phase::Running | Phase::Updating { .. } => Ok(state),
            Phase::Stopping(_) | Phase::Updated => Err(SupervisorError::Rejected {
                action: "start",
                state,
            }),
        }
    }

    async fn restart(&mut self, forced: bool, reply: Reply) {
        match self.phase {
            Phase::Starting { .. }
            | Phase::Running
            | Phase::Updating { .. }
            | Phase::Stopping(_)
                if self.handle.is_some() =>
            {
                info!(forced, "Restarting node");
                self.wanted = WantedState::Running;
                self.begin_shutdown(forced, reply);
            }
            _ => {
                let outcome = self.start().await;
                let _ = reply.send(outcome);
            }
        }
    }

    fn stop(&mut self, forced: bool, reply: Reply) {
        self.wanted = WantedState::Stopped;
        match self.phase {
            Phase::Starting { .. }
            | Phase::Running
            | Phase::Updating { .. }
            | Phase::Updated
            | Phase::Stopping(_)
                if self.handle.is_some() =>
            {
                self.begin_shutdown(forced, reply);
            }
            Phase::Unrecoverable | Phase::Error => {
                let _ = reply.send(Ok(self.phase.state()));
            }
            _ => {
                self.set_phase(Phase::Stopped);
                let _ = reply.send(Ok(SupervisorState::Stopped));
            }
        }
    }

    /// Launches a fresh node and enters `phase`. Spawn failures land in Error.
    pub(super) async fn launch(&mut self, phase: Phase) -> Result<(), SupervisorError> {
        self.retire_handle();
        self.suppress_graceful = false;
        self.attempts += 1;
        self.epoch += 1;
        info!(
            attempt = self.attempts,
            max = self.config.startup_max_retries,
            "Launching node"
        );
        let reporter = Reporter::new(self.epoch, self.events.clone());
        match self.launcher.launch(&self.config, reporter).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.set_phase(phase);
                Ok(())
            }
            Err(err) => {
                error!(?err, "Failed to launch node");
                self.wanted = WantedState::Stopped;
                self.set_phase(Phase::Error);
                Err(SupervisorError::Launch(format!("{err:#}")))
            }
        }
    }

    /// Drops the current handle, killing the node behind it if it is still there.
    pub(super) fn retire_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(pid = ?handle.pid, epoch = handle.epoch, "Retiring node handle");
            if let Err(err) = self.launcher.signal(&handle, Signal::SIGKILL) {
                debug!(?err, "Retired node already gone");
            }
        }
    }

    fn on_ready(&mut self, tls: TlsConfig) {
        let next = match self.phase {
            Phase::Starting { .. } | Phase::Running => Phase::Running,
            Phase::Updating { relaunched: true } => Phase::Updated,
            _ => {
                debug!(state = %self.phase.state(), "Readiness ignored");
                return;
            }
        };
        self.attempts = 0;
        let tls_changed = self.store_tls(tls);
        self.set_phase(next);
        if tls_changed {
            self.notify_tls();
        }
    }

    async fn on_exit(&mut self, exit_code: i32) {
        match self.phase {
            Phase::Running if exit_code == self.config.update_exit_code => {
                info!("Node exited to apply an update");
                self.set_phase(Phase::Updating { relaunched: true });
                self.relaunch(Phase::Updating { relaunched: true }).await;
            }
            Phase::Running if exit_code == 0 => {
                warn!("Node shut itself down");
                self.wanted = WantedState::Stopped;
                self.set_phase(Phase::Stopped);
            }
            Phase::Running => {
                warn!(exit_code, "Node crashed");
                self.schedule_restart();
            }
            Phase::Updating { relaunched: false } => {
                info!(exit_code, "Node exited for update, relaunching");
                self.set_phase(Phase::Updating { relaunched: true });
                self.relaunch(Phase::Updating { relaunched: true }).await;
            }
            Phase::Starting { .. } | Phase::Updating { relaunched: true } => {
                warn!(exit_code, "Node exited during startup");
                self.on_startup_failed().await;
            }
            Phase::Stopping(_) => {
                info!(exit_code, "Stopped node");
                self.finish_shutdown().await;
            }
            _ => debug!(exit_code, state = %self.phase.state(), "Exit ignored"),
        }
    }

    /// The node never got ready. Retry, back off, or give up once attempts run out.
    async fn on_startup_failed(&mut self) {
        if self.attempts >= self.config.startup_max_retries {
            error!(
                attempts = self.attempts,
                "Node failed to start, giving up"
            );
            self.wanted = WantedState::Stopped;
            self.set_phase(Phase::Unrecoverable);
            return;
        }
        match self.phase {
            Phase::Starting { recovering: true } => self.schedule_restart(),
            Phase::Starting { recovering: false } => {
                self.relaunch(Phase::Starting { recovering: false }).await
            }
            Phase::Updating { .. } => self.relaunch(Phase::Updating { relaunched: true }).await,
            _ => {}
        }
    }

    async fn relaunch(&mut self, phase: Phase) {
        if let Err(err) = self.launch(phase).await {
            warn!(%err, "Relaunch failed");
        }
    }

    /// A fresh counter means this is the first crash since the node last ran: restart at once.
    fn restart_delay(&self) -> Duration {
        if self.attempts == 0 {
            Duration::ZERO
        } else {
            self.config.crash_cooldown
        }
    }

    fn schedule_restart(&mut self) {
        let delay = self.restart_delay();
        info!(
            "Restarting node in {}",
            humantime::format_duration(delay)
        );
        self.wanted = WantedState::Running;
        self.epoch += 1;
        self.set_phase(Phase::Crashed {
            restart_at: Instant::now() + delay,
            epoch: self.epoch,
        });
    }

    async fn inject_fault(&mut self, fault: FaultSpec) -> Outcome {
        warn!(?fault, "Injecting fault");
        match fault {
            FaultSpec::Crash => {
                if self.handle.is_none() {
                    return Err(SupervisorError::Rejected {
                        action: "inject a crash",
                        state: self.phase.state(),
                    });
                }
                self.retire_handle();
                self.on_exit(FAULT_EXIT_CODE).await;
            }
            FaultSpec::Unresponsive => self.suppress_graceful = true,
            FaultSpec::Unrecoverable => {
                self.retire_handle();
                self.wanted = WantedState::Stopped;
                self.set_phase(Phase::Unrecoverable);
            }
            FaultSpec::Error => {
                self.retire_handle();
                self.wanted = WantedState::Stopped;
                self.set_phase(Phase::Error);
            }
        }
        Ok(self.phase.state())
    }
}
