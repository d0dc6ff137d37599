mod event_handlers;
mod probe;
mod run;
mod shutdown;
mod types;
mod update;

pub use self::run::{Launcher, NodeLauncher, RuntimeHandle};
pub use self::types::{FaultSpec, Notification, Outcome, Snapshot, SupervisorState, TlsConfig};

use self::types::*;
use self::update::UpdateWatcher;
use crate::configs::NodeConfig;
use crate::error::SupervisorError;
use chrono::Local;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

const NOTIFICATION_BUFFER: usize = 64;

/// Owner of the lifecycle state. Runs as a single task; everything else talks to it
/// through [`SupervisorHandle`] or a launch-bound [`Reporter`](run::Reporter).
pub struct Supervisor {
    config: Arc<NodeConfig>,
    launcher: Arc<dyn Launcher>,
    phase: Phase,
    wanted: WantedState,
    attempts: u32,
    epoch: u64,
    handle: Option<RuntimeHandle>,
    tls: Option<TlsConfig>,
    status: serde_json::Value,
    suppress_graceful: bool,
    stop_waiters: Vec<Reply>,
    update: UpdateWatcher,
    events: UnboundedSender<Event>,
    snapshot: watch::Sender<Snapshot>,
    notifications: broadcast::Sender<Notification>,
}

/// Cloneable front door to a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: UnboundedSender<Event>,
    snapshot: watch::Receiver<Snapshot>,
    notifications: broadcast::Sender<Notification>,
}

/// Starts the supervisor task. The node is not launched until [`SupervisorHandle::request_start`].
pub fn spawn<L: Launcher>(config: NodeConfig, launcher: L) -> SupervisorHandle {
    let (events, receiver) = mpsc::unbounded_channel();
    let (snapshot, snapshot_receiver) = watch::channel(Snapshot::default());
    let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
    let supervisor = Supervisor {
        config: Arc::new(config),
        launcher: Arc::new(launcher),
        phase: Phase::Stopped,
        wanted: WantedState::Stopped,
        attempts: 0,
        epoch: 0,
        handle: None,
        tls: None,
        status: serde_json::Value::Null,
        suppress_graceful: false,
        stop_waiters: Vec::new(),
        update: UpdateWatcher::default(),
        events: events.clone(),
        snapshot,
        notifications: notifications.clone(),
    };
    tokio::spawn(supervisor.run(receiver).instrument(info_span!("supervisor")));
    SupervisorHandle {
        events,
        snapshot: snapshot_receiver,
        notifications,
    }
}

impl SupervisorHandle {
    pub async fn request_start(&self) -> Outcome {
        self.request(Controls::Start).await
    }

    /// Resolves once the node is gone (or the shutdown failed).
    pub async fn request_stop(&self, forced: bool) -> Outcome {
        self.request(|reply| Controls::Stop { forced, reply }).await
    }

    /// Stops the node if it is alive, then starts it again.
    pub async fn request_restart(&self, forced: bool) -> Outcome {
        self.request(|reply| Controls::Restart { forced, reply })
            .await
    }

    /// Waits for the node to finish an update. Concurrent callers share one wait.
    pub async fn expect_update(&self) -> Outcome {
        self.request(Controls::ExpectUpdate).await
    }

    pub async fn inject_fault(&self, fault: FaultSpec) -> Outcome {
        self.request(|reply| Controls::InjectFault { fault, reply })
            .await
    }

    pub async fn set_status(&self, status: serde_json::Value) -> Outcome {
        self.request(|reply| Controls::SetStatus(status, reply))
            .await
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.snapshot.borrow().state
    }

    pub fn status(&self) -> serde_json::Value {
        self.snapshot.borrow().status.clone()
    }

    pub fn tls_config(&self) -> Option<TlsConfig> {
        self.snapshot.borrow().tls.clone()
    }

    #[cfg(test)]
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn request(&self, control: impl FnOnce(Reply) -> Controls) -> Outcome {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::Control(control(reply)))
            .map_err(|_| SupervisorError::Closed)?;
        response.await.map_err(|_| SupervisorError::Closed)?
    }
}

impl Supervisor {
    async fn run(mut self, mut receiver: UnboundedReceiver<Event>) {
        info!("Supervisor ready");
        while let Some(event) = self.fetch_event(&mut receiver).await {
            debug!(?event, state = %self.phase.state(), "Handling event");
            match event {
                Event::Control(control) => self.handle_control(control).await,
                Event::Process { epoch, signal } => {
                    self.handle_process_signal(epoch, signal).await
                }
                Event::TimeoutReached { timer, epoch } => self.handle_timeout(timer, epoch).await,
            }
        }
    }

    async fn fetch_event(&self, receiver: &mut UnboundedReceiver<Event>) -> Option<Event> {
        let phase_deadline = self.phase.deadline();
        let update_deadline = self.update.deadline();
        select! {
            biased;
            event = receiver.recv() => event,
            epoch = sleep_until(phase_deadline) => {
                Some(Event::TimeoutReached { timer: Timer::Phase, epoch })
            },
            epoch = sleep_until(update_deadline) => {
                Some(Event::TimeoutReached { timer: Timer::UpdateWait, epoch })
            },
        }
    }

    /// Commits a phase: snapshot first, then notifications, then waiters.
    fn set_phase(&mut self, phase: Phase) {
        let before = self.phase.state();
        self.phase = phase;
        let after = self.phase.state();
        let changed = before != after;
        if changed {
            info!("Node state: {} -> {}", before, after);
        }
        self.publish(changed);
        if changed {
            let _ = self.notifications.send(Notification::State(after));
        }
        self.update.observe(after);
    }

    fn publish(&mut self, state_changed: bool) {
        let previous = self.snapshot.borrow().since;
        self.snapshot.send_replace(Snapshot {
            state: self.phase.state(),
            status: self.status.clone(),
            tls: self.tls.clone(),
            attempts: self.attempts,
            pid: self.handle.as_ref().and_then(|handle| handle.pid),
            since: if state_changed { Local::now() } else { previous },
        });
    }

    /// Returns whether the stored TLS config changed. The caller publishes.
    fn store_tls(&mut self, tls: TlsConfig) -> bool {
        if self.tls.as_ref() == Some(&tls) {
            return false;
        }
        self.tls = Some(tls);
        true
    }

    fn notify_tls(&self) {
        let _ = self
            .notifications
            .send(Notification::TlsConfig(self.tls.clone()));
    }
}

async fn sleep_until(deadline: Option<(Instant, u64)>) -> u64 {
    match deadline {
        Some((at, epoch)) => {
            tokio::time::sleep_until(at).await;
            epoch
        }
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::configs::test_node_config;
    use nix::sys::signal::Signal;
    use std::time::Duration;

    fn supervisor(config: NodeConfig) -> (SupervisorHandle, FakeLauncher) {
        let launcher = FakeLauncher::default();
        (spawn(config, launcher.clone()), launcher)
    }

    async fn running(config: NodeConfig) -> (SupervisorHandle, FakeLauncher) {
        let (handle, launcher) = supervisor(config);
        assert_eq!(handle.request_start().await, Ok(SupervisorState::Starting));
        launcher.last().ready(test_tls(8090));
        wait_for(&handle, SupervisorState::Running).await;
        (handle, launcher)
    }

    #[tokio::test(start_paused = true)]
    async fn startup_failures_end_unrecoverable_after_max_attempts() {
        let (handle, launcher) = supervisor(test_node_config());
        handle.request_start().await.unwrap();
        assert_eq!(handle.snapshot().attempts, 1);

        launcher.reporter(1).not_ready();
        let snapshot = wait_until(&handle, |s| s.attempts == 2).await;
        assert_eq!(snapshot.state, SupervisorState::Starting);
        assert_eq!(launcher.launches(), 2);

        launcher.reporter(2).not_ready();
        let snapshot = wait_for(&handle, SupervisorState::Unrecoverable).await;
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(launcher.launches(), 2);
        // Unready nodes are killed before the next attempt
        assert_eq!(launcher.signals(), vec![Signal::SIGKILL, Signal::SIGKILL]);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.launches(), 2);
        assert_eq!(handle.state(), SupervisorState::Unrecoverable);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_tracks_startup_exits() {
        let mut config = test_node_config();
        config.startup_max_retries = 4;
        let (handle, launcher) = supervisor(config);
        handle.request_start().await.unwrap();

        for launch in 1..=3 {
            launcher.reporter(launch).exited(1);
            let snapshot = wait_until(&handle, |s| s.attempts == launch as u32 + 1).await;
            assert_eq!(snapshot.state, SupervisorState::Starting);
            assert_eq!(launcher.launches(), launch + 1);
        }
        launcher.reporter(4).exited(1);
        let snapshot = wait_for(&handle, SupervisorState::Unrecoverable).await;
        assert_eq!(snapshot.attempts, 4);
        assert_eq!(launcher.launches(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn first_crash_restarts_immediately() {
        let (handle, launcher) = running(test_node_config()).await;
        assert_eq!(handle.snapshot().attempts, 0);
        let crashed_at = Instant::now();

        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        assert!(crashed_at.elapsed() < Duration::from_secs(1));
        let snapshot = wait_for(&handle, SupervisorState::Starting).await;
        assert_eq!(snapshot.attempts, 1);

        launcher.last().ready(test_tls(8090));
        let snapshot = wait_for(&handle, SupervisorState::Running).await;
        assert_eq!(snapshot.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_crash_waits_for_cooldown() {
        let mut config = test_node_config();
        config.startup_max_retries = 5;
        let (handle, launcher) = running(config).await;
        let mut notifications = handle.subscribe();

        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        let second_crash = Instant::now();
        launcher.last().exited(1);

        wait_for(&handle, SupervisorState::Crashed).await;
        assert_eq!(launcher.launches(), 2);
        launcher.wait_launches(3).await;
        assert!(second_crash.elapsed() >= Duration::from_secs(30));
        let snapshot = wait_for(&handle, SupervisorState::Starting).await;
        assert_eq!(snapshot.attempts, 2);

        let mut seen = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            seen.push(notification);
        }
        assert_eq!(
            seen,
            vec![
                Notification::State(SupervisorState::Crashed),
                Notification::State(SupervisorState::Starting),
                Notification::State(SupervisorState::Crashed),
                Notification::State(SupervisorState::Starting),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn crash_loop_is_capped() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        launcher.last().exited(1);
        launcher.wait_launches(3).await;
        launcher.last().exited(1);
        wait_for(&handle, SupervisorState::Unrecoverable).await;
        assert_eq!(launcher.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_while_running_stops() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(0);
        wait_for(&handle, SupervisorState::Stopped).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop() {
        let (handle, launcher) = running(test_node_config()).await;
        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM]);
        assert_eq!(handle.snapshot().pid, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_graceful_stop_escalates_to_kill() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);
        let stopping_at = Instant::now();

        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        let elapsed = stopping_at.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(20));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_stop_kills_right_away() {
        let (handle, launcher) = running(test_node_config()).await;
        let stopping_at = Instant::now();
        assert_eq!(handle.request_stop(true).await, Ok(SupervisorState::Stopped));
        assert!(stopping_at.elapsed() < Duration::from_secs(1));
        assert_eq!(launcher.signals(), vec![Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_kill_ends_in_error() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);
        launcher.survive_kill(true);
        let stopping_at = Instant::now();

        assert_eq!(
            handle.request_stop(false).await,
            Err(SupervisorError::ShutdownTimeout)
        );
        assert!(stopping_at.elapsed() >= Duration::from_secs(20));
        assert_eq!(handle.state(), SupervisorState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_share_one_sequence() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);

        let (first, second) = tokio::join!(handle.request_stop(false), handle.request_stop(false));
        assert_eq!(first, Ok(SupervisorState::Stopped));
        assert_eq!(second, Ok(SupervisorState::Stopped));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_stop_escalates_graceful_in_flight() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);
        let stopping_at = Instant::now();

        let (first, second) = tokio::join!(handle.request_stop(false), handle.request_stop(true));
        assert_eq!(first, Ok(SupervisorState::Stopped));
        assert_eq!(second, Ok(SupervisorState::Stopped));
        assert!(stopping_at.elapsed() < Duration::from_secs(1));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_while_stopping_is_ignored() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);
        let stopper = handle.clone();
        let stop = tokio::spawn(async move { stopper.request_stop(false).await });
        wait_for(&handle, SupervisorState::Stopping).await;

        launcher.last().ready(test_tls(9000));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), SupervisorState::Stopping);
        assert_eq!(handle.tls_config(), Some(test_tls(8090)));
        assert_eq!(stop.await.unwrap(), Ok(SupervisorState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_process_signals_are_ignored() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(1);
        launcher.wait_launches(2).await;

        launcher.reporter(1).exited(1);
        launcher.reporter(1).ready(test_tls(9000));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), SupervisorState::Starting);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_supersedes_scheduled_restart() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        launcher.last().exited(1);
        wait_for(&handle, SupervisorState::Crashed).await;

        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.launches(), 2);
        assert_eq!(handle.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_scheduled_restart() {
        let mut config = test_node_config();
        config.startup_max_retries = 5;
        let (handle, launcher) = running(config).await;
        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        launcher.last().exited(1);
        wait_for(&handle, SupervisorState::Crashed).await;

        assert_eq!(handle.request_restart(true).await, Ok(SupervisorState::Starting));
        assert_eq!(launcher.launches(), 3);
        assert_eq!(handle.snapshot().attempts, 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_running_node() {
        let (handle, launcher) = running(test_node_config()).await;
        assert_eq!(handle.request_restart(false).await, Ok(SupervisorState::Starting));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM]);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(handle.snapshot().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (handle, launcher) = running(test_node_config()).await;
        assert_eq!(handle.request_start().await, Ok(SupervisorState::Running));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_is_an_error() {
        let (handle, launcher) = supervisor(test_node_config());
        launcher.fail_launch(true);
        assert!(matches!(
            handle.request_start().await,
            Err(SupervisorError::Launch(_))
        ));
        assert_eq!(handle.state(), SupervisorState::Error);

        launcher.fail_launch(false);
        assert_eq!(handle.request_start().await, Ok(SupervisorState::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn tls_is_pushed_after_state_and_only_on_change() {
        let (handle, launcher) = supervisor(test_node_config());
        let mut notifications = handle.subscribe();
        handle.request_start().await.unwrap();
        launcher.last().ready(test_tls(8090));
        wait_for(&handle, SupervisorState::Running).await;
        launcher.last().ready(test_tls(8090));
        launcher.last().ready(test_tls(8091));
        wait_until(&handle, |s| s.tls == Some(test_tls(8091))).await;

        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::State(SupervisorState::Starting)
        );
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::State(SupervisorState::Running)
        );
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::TlsConfig(Some(test_tls(8090)))
        );
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::TlsConfig(Some(test_tls(8091)))
        );
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tls_survives_restarts() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(1);
        wait_until(&handle, |s| s.state == SupervisorState::Starting).await;
        assert_eq!(handle.tls_config(), Some(test_tls(8090)));
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_stored_and_pushed_once() {
        let (handle, _launcher) = supervisor(test_node_config());
        let mut notifications = handle.subscribe();
        let status = serde_json::json!({ "syncProgress": 42 });

        handle.set_status(status.clone()).await.unwrap();
        handle.set_status(status.clone()).await.unwrap();
        assert_eq!(handle.status(), status);
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::Status(status)
        );
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn update_completes_for_every_waiter() {
        let (handle, launcher) = running(test_node_config()).await;
        let drive = async {
            launcher.last().update_signalled();
            wait_for(&handle, SupervisorState::Updating).await;
            launcher.last().exited(20);
            launcher.wait_launches(2).await;
            launcher.last().ready(test_tls(8090));
        };
        let (first, second, _) = tokio::join!(handle.expect_update(), handle.expect_update(), drive);
        assert_eq!(first, Ok(SupervisorState::Updated));
        assert_eq!(second, Ok(SupervisorState::Updated));
        assert_eq!(handle.snapshot().attempts, 0);
        assert_eq!(handle.expect_update().await, Ok(SupervisorState::Updated));
    }

    #[tokio::test(start_paused = true)]
    async fn update_exit_code_starts_update() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.last().exited(20);
        launcher.wait_launches(2).await;
        assert_eq!(handle.state(), SupervisorState::Updating);
        launcher.last().ready(test_tls(8090));
        wait_for(&handle, SupervisorState::Updated).await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_wait_times_out_once_for_all() {
        let (handle, _launcher) = running(test_node_config()).await;
        let started = Instant::now();
        let (first, second) = tokio::join!(handle.expect_update(), handle.expect_update());
        assert_eq!(first, Err(SupervisorError::UpdateTimeout));
        assert_eq!(second, Err(SupervisorError::UpdateTimeout));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn update_wait_is_abandoned_on_unrecoverable() {
        let (handle, _launcher) = running(test_node_config()).await;
        let (waited, injected) = tokio::join!(
            handle.expect_update(),
            handle.inject_fault(FaultSpec::Unrecoverable)
        );
        assert_eq!(injected, Ok(SupervisorState::Unrecoverable));
        assert_eq!(
            waited,
            Err(SupervisorError::UpdateAbandoned(
                SupervisorState::Unrecoverable
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn injected_crash_takes_the_crash_path() {
        let (handle, launcher) = running(test_node_config()).await;
        assert_eq!(
            handle.inject_fault(FaultSpec::Crash).await,
            Ok(SupervisorState::Crashed)
        );
        // The retired node is killed so it cannot linger next to its replacement
        assert_eq!(launcher.signals(), vec![Signal::SIGKILL]);
        launcher.wait_launches(2).await;
        wait_for(&handle, SupervisorState::Starting).await;
    }

    #[tokio::test(start_paused = true)]
    async fn injected_terminal_states_are_reversible() {
        for (fault, state) in [
            (FaultSpec::Unrecoverable, SupervisorState::Unrecoverable),
            (FaultSpec::Error, SupervisorState::Error),
        ] {
            let (handle, launcher) = running(test_node_config()).await;
            assert_eq!(handle.inject_fault(fault).await, Ok(state));
            assert_eq!(handle.state(), state);
            assert_eq!(handle.request_start().await, Ok(SupervisorState::Starting));
            assert_eq!(launcher.launches(), 2);
            assert_eq!(handle.snapshot().attempts, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn injected_unresponsiveness_exhausts_graceful_window() {
        let (handle, launcher) = running(test_node_config()).await;
        handle.inject_fault(FaultSpec::Unresponsive).await.unwrap();
        let stopping_at = Instant::now();
        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        assert!(stopping_at.elapsed() >= Duration::from_secs(10));
        assert_eq!(launcher.signals(), vec![Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_fault_needs_a_live_node() {
        let (handle, _launcher) = supervisor(test_node_config());
        assert!(matches!(
            handle.inject_fault(FaultSpec::Crash).await,
            Err(SupervisorError::Rejected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_from_terminal_states_is_ignored() {
        for fault in [FaultSpec::Unrecoverable, FaultSpec::Error] {
            let (handle, launcher) = running(test_node_config()).await;
            let state = handle.inject_fault(fault).await.unwrap();
            let before = handle.snapshot();

            launcher.reporter(1).ready(test_tls(9000));
            tokio::time::sleep(Duration::from_secs(1)).await;
            let after = handle.snapshot();
            assert_eq!(after.state, state);
            assert_eq!(after.tls, Some(test_tls(8090)));
            assert_eq!(after.attempts, before.attempts);
            assert_eq!(launcher.launches(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_failed_shutdown_is_ignored() {
        let (handle, launcher) = running(test_node_config()).await;
        launcher.ignore_graceful(true);
        launcher.survive_kill(true);
        assert_eq!(
            handle.request_stop(false).await,
            Err(SupervisorError::ShutdownTimeout)
        );

        launcher.last().ready(test_tls(9000));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), SupervisorState::Error);
        assert_eq!(handle.tls_config(), Some(test_tls(8090)));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_fault_is_spent_by_a_forced_stop() {
        let (handle, launcher) = running(test_node_config()).await;
        handle.inject_fault(FaultSpec::Unresponsive).await.unwrap();
        assert_eq!(handle.request_stop(true).await, Ok(SupervisorState::Stopped));

        handle.request_start().await.unwrap();
        launcher.last().ready(test_tls(8090));
        wait_for(&handle, SupervisorState::Running).await;
        let stopping_at = Instant::now();
        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        assert!(stopping_at.elapsed() < Duration::from_secs(1));
        assert_eq!(launcher.signals(), vec![Signal::SIGKILL, Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_fault_does_not_outlive_its_node() {
        let (handle, launcher) = running(test_node_config()).await;
        handle.inject_fault(FaultSpec::Unresponsive).await.unwrap();
        launcher.last().exited(1);
        launcher.wait_launches(2).await;
        launcher.last().ready(test_tls(8090));
        wait_for(&handle, SupervisorState::Running).await;

        let stopping_at = Instant::now();
        assert_eq!(handle.request_stop(false).await, Ok(SupervisorState::Stopped));
        assert!(stopping_at.elapsed() < Duration::from_secs(1));
        assert_eq!(launcher.signals(), vec![Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn update_wait_settles_at_once_when_no_update_can_follow() {
        let (handle, _launcher) = supervisor(test_node_config());
        let started = Instant::now();
        assert_eq!(
            handle.expect_update().await,
            Err(SupervisorError::UpdateAbandoned(SupervisorState::Stopped))
        );
        assert!(started.elapsed() < Duration::from_secs(1));

        handle.inject_fault(FaultSpec::Error).await.unwrap();
        assert_eq!(
            handle.expect_update().await,
            Err(SupervisorError::UpdateAbandoned(SupervisorState::Error))
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
