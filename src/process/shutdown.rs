use super::types::{Phase, Reply, StoppingState, WantedState};
use super::{Supervisor, SupervisorState};
use crate::error::SupervisorError;
use nix::sys::signal::Signal;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl Supervisor {
    /// Starts the graceful-then-forced sequence, or joins the one already in flight.
    pub(super) fn begin_shutdown(&mut self, forced: bool, reply: Reply) {
        self.stop_waiters.push(reply);
        match self.phase {
            Phase::Stopping(StoppingState::Graceful { .. }) if forced => {
                info!("Forced stop requested, escalating");
                self.escalate();
            }
            Phase::Stopping(_) => debug!("Joining shutdown in flight"),
            _ if forced => self.escalate(),
            _ => self.request_graceful(),
        }
    }

    fn request_graceful(&mut self) {
        let Some(handle) = &self.handle else {
            return;
        };
        info!("Stopping node...");
        if std::mem::take(&mut self.suppress_graceful) {
            warn!("Fault injected: withholding graceful stop request");
        } else if let Err(err) = self
            .launcher
            .signal(handle, self.config.stop.graceful_signal.into())
        {
            warn!(?err, "Failed to request graceful stop, escalating");
            self.escalate();
            return;
        }
        self.epoch += 1;
        self.set_phase(Phase::Stopping(StoppingState::Graceful {
            timeout_at: Instant::now() + self.config.stop.term_timeout,
            epoch: self.epoch,
        }));
    }

    fn escalate(&mut self) {
        self.suppress_graceful = false;
        let Some(handle) = &self.handle else {
            return;
        };
        match self.launcher.signal(handle, Signal::SIGKILL) {
            Ok(()) => {
                self.epoch += 1;
                self.set_phase(Phase::Stopping(StoppingState::Kill {
                    timeout_at: Instant::now() + self.config.stop.kill_timeout,
                    epoch: self.epoch,
                }));
            }
            Err(err) => {
                error!(?err, "Failed to kill node");
                self.fail_shutdown(SupervisorError::Signal(format!("{err:#}")));
            }
        }
    }

    pub(super) fn on_stop_timeout(&mut self) {
        match self.phase {
            Phase::Stopping(StoppingState::Graceful { .. }) => {
                warn!(
                    "Node ignored stop request for {}, killing",
                    humantime::format_duration(self.config.stop.term_timeout)
                );
                self.escalate();
            }
            Phase::Stopping(StoppingState::Kill { .. }) => {
                error!("Kill timeout reached, node still alive");
                self.fail_shutdown(SupervisorError::ShutdownTimeout);
            }
            _ => {}
        }
    }

    /// The node exited while stopping. Starts it again if a restart asked for that.
    pub(super) async fn finish_shutdown(&mut self) {
        self.set_phase(Phase::Stopped);
        let outcome = if self.wanted == WantedState::Running {
            self.attempts = 0;
            match self.launch(Phase::Starting { recovering: false }).await {
                Ok(()) => Ok(self.phase.state()),
                Err(err) => Err(err),
            }
        } else {
            Ok(SupervisorState::Stopped)
        };
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn fail_shutdown(&mut self, err: SupervisorError) {
        self.wanted = WantedState::Stopped;
        self.set_phase(Phase::Error);
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}
