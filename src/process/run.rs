use super::probe::{self, ReadyOutcome, ReadySignal};
use super::types::{Event, ProcessSignal, TlsConfig};
use crate::configs::NodeConfig;
use async_trait::async_trait;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use log_buffer::LogBuffer;
use new_string_template::template::Template;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Live reference to one launched node. Never reused across launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub pid: Option<i32>,
    pub epoch: u64,
    pub started_at: Instant,
}

/// Channel back into the state machine, bound to a single launch epoch.
#[derive(Debug, Clone)]
pub struct Reporter {
    epoch: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl Reporter {
    pub(super) fn new(epoch: u64, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { epoch, events }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ready(&self, tls: TlsConfig) {
        self.send(ProcessSignal::Ready(tls));
    }

    pub fn not_ready(&self) {
        self.send(ProcessSignal::NotReady);
    }

    pub fn exited(&self, exit_code: i32) {
        self.send(ProcessSignal::Exited(exit_code));
    }

    pub fn update_signalled(&self) {
        self.send(ProcessSignal::UpdateSignalled);
    }

    fn send(&self, signal: ProcessSignal) {
        let event = Event::Process {
            epoch: self.epoch,
            signal,
        };
        if let Err(err) = self.events.send(event) {
            debug!(?err, "Supervisor gone, dropping process signal");
        }
    }
}

/// Starts nodes and delivers signals to them.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Spawns the node and returns without waiting for it to become ready.
    async fn launch(&self, config: &NodeConfig, reporter: Reporter) -> Result<RuntimeHandle>;

    fn signal(&self, handle: &RuntimeHandle, signal: Signal) -> Result<()>;
}

/// Launches the node as a child process of this one.
#[derive(Debug, Default)]
pub struct NodeLauncher;

#[async_trait]
impl Launcher for NodeLauncher {
    #[instrument(skip_all, fields(epoch = reporter.epoch()))]
    async fn launch(&self, config: &NodeConfig, reporter: Reporter) -> Result<RuntimeHandle> {
        let epoch = reporter.epoch();
        let command = resolve_command(config)?;
        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .await
            .wrap_err("Failed to open node log file")?;

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .current_dir(&config.working_directory)
            .spawn()
            .wrap_err("Failed to spawn node!")?;

        let pid = child.id().ok_or_else(|| eyre!("Node exited instantly"))? as i32;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("Missing node stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("Missing node stderr"))?;

        let (merge_sender, mut merge_receiver) = mpsc::unbounded_channel::<String>();
        tokio::spawn(
            read_lines(stdout, merge_sender.clone()).instrument(info_span!("read_stdout", pid)),
        );
        tokio::spawn(read_lines(stderr, merge_sender).instrument(info_span!("read_stderr", pid)));

        let (probe_sender, probe_receiver) = mpsc::unbounded_channel::<String>();
        let output_cache = new_output_cache(config.output_cache_size);

        // Output merger: log file, output cache, update marker and readiness lines
        let merger_cache = output_cache.clone();
        let merger_reporter = reporter.clone();
        let update_marker = config.update_marker.clone();
        tokio::spawn(
            async move {
                while let Some(line) = merge_receiver.recv().await {
                    if let Err(err) = log_file.write_all(line.as_bytes()).await {
                        error!(?err, "Writing node log failed");
                    }
                    if matches!(&update_marker, Some(marker) if line.contains(marker.as_str())) {
                        info!("Node announced an update");
                        merger_reporter.update_signalled();
                    }
                    cache_line(&merger_cache, &line);
                    let _ = probe_sender.send(line);
                }
                if let Err(err) = log_file.flush().await {
                    warn!(?err, "Flushing node log failed");
                }
                debug!("Node output closed");
            }
            .instrument(info_span!("merge_output", pid)),
        );

        // Startup prober
        let mut ready_signal = ReadySignal::new(config, probe_receiver);
        let probe_reporter = reporter.clone();
        let probe_config = config.clone();
        tokio::spawn(
            async move {
                match probe::await_ready(&mut ready_signal, probe_config.startup_timeout).await {
                    ReadyOutcome::Ready { port } => {
                        probe_reporter.ready(TlsConfig::for_node(&probe_config, port))
                    }
                    ReadyOutcome::TimedOut => {
                        warn!(
                            "Node not ready after {}",
                            humantime::format_duration(probe_config.startup_timeout)
                        );
                        probe_reporter.not_ready();
                    }
                }
            }
            .instrument(info_span!("probe_ready", pid)),
        );

        // Exit watcher
        tokio::spawn(
            async move {
                let exit_code = match child.wait().await {
                    Ok(status) => code_of(status),
                    Err(err) => {
                        error!(?err, "Waiting for node failed");
                        -1
                    }
                };
                if exit_code == 0 {
                    info!("Node exited with exit code 0");
                } else {
                    warn!(
                        "Node exited with exit code {}, last output:\n{}",
                        exit_code,
                        last_output(&output_cache)
                    );
                }
                reporter.exited(exit_code);
            }
            .instrument(info_span!("wait_exit", pid)),
        );

        info!("Node started: {}", pid);
        Ok(RuntimeHandle {
            pid: Some(pid),
            epoch,
            started_at: Instant::now(),
        })
    }

    fn signal(&self, handle: &RuntimeHandle, signal: Signal) -> Result<()> {
        let pid = handle.pid.ok_or_else(|| eyre!("Node pid unknown"))?;
        kill(Pid::from_raw(pid), signal).wrap_err("Failed to send signal")
    }
}

/// Most recent node output, bounded in bytes.
type OutputCache = Arc<Mutex<LogBuffer<Vec<u8>>>>;

fn new_output_cache(size: u32) -> OutputCache {
    Arc::new(Mutex::new(LogBuffer::new(vec![0; size as usize])))
}

fn cache_line(cache: &OutputCache, line: &str) {
    let mut cache = cache.lock();
    if let Err(err) = cache.write_str(line) {
        error!(?err, "Cache error");
    }
}

fn last_output(cache: &OutputCache) -> String {
    cache.lock().extract().trim_end().to_string()
}

async fn read_lines<R: AsyncRead + Unpin>(stream: R, sender: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(n) if n < 1 => {
                break;
            }
            Err(err) => {
                error!(?err, "Reading node output failed");
                break;
            }
            _ => {}
        }
        if sender.send(line).is_err() {
            break;
        }
    }
    debug!("Stream closed");
}

/// Splits the configured command line and fills in the placeholders of every word.
pub fn resolve_command(config: &NodeConfig) -> Result<Vec<String>> {
    let words = shell_words::split(&config.command).wrap_err("Invalid command")?;
    if words.is_empty() {
        return Err(eyre!("Empty command"));
    }
    let data = {
        let mut map = HashMap::new();
        map.insert("tls_dir", config.tls_dir.to_string_lossy().into_owned());
        map.insert("log_file", config.log_file.to_string_lossy().into_owned());
        map.insert(
            "working_directory",
            config.working_directory.to_string_lossy().into_owned(),
        );
        map.insert("api_port", config.api_port.to_string());
        map
    };
    words
        .iter()
        .map(|word| {
            Template::new(word)
                .render(&data)
                .wrap_err_with(|| format!("Failed to render argument {word:?}"))
        })
        .collect()
}

/// Signal deaths are folded into the shell convention of `128 + signo`.
fn code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}
