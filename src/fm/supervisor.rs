use crate::fm::config::MasterConfig;
use crate::fm::escalate::{self, KillGuard};
use crate::fm::fm_event;
use crate::fm::ipc::{self, FromWorker, ToWorker};
use crate::fm::monitor::{spawn_monitor, ProcessSampler, Resource, SysinfoSampler};
use crate::fm::sockets::SocketRegistry;
use crate::fm::version::VersionGuard;
use crate::fm::worker::{Pool, WorkerRecord};
use anyhow::Context as _;
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Everything the control loop reacts to: OS signals, worker lifecycle events,
/// monitor verdicts and timer expiries all arrive here, so handler logic is
/// ordinary sequential code over state owned by one task.
#[derive(Debug)]
pub enum Cmd {
    Reload,
    Terminate,
    ToggleMonitoring,
    WorkerReady {
        pid: u32,
        address: Option<String>,
    },
    WorkerExited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    WorkerMessage {
        pid: u32,
        msg: FromWorker,
    },
    RespawnDue {
        index: usize,
    },
    ReplaceWorker {
        pid: u32,
        resource: Resource,
    },
    NotifyWorker {
        pid: u32,
        msg: ToWorker,
    },
    SamplerFailed {
        error: String,
    },
    Status {
        resp: oneshot::Sender<Vec<WorkerStatus>>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub pid: u32,
    pub index: usize,
    pub generation: u64,
    pub uptime: Duration,
    pub ready: bool,
    pub expected_exit: bool,
}

/// Per-worker runtime plumbing kept alongside the pool record: the stdin
/// writer channel, the pending force-kill guard and the monitor cancel flag.
struct WorkerHandles {
    ipc_tx: UnboundedSender<String>,
    kill: Option<KillGuard>,
    monitor_cancel: Arc<AtomicBool>,
    ready_seen: bool,
}

struct ReplacePlan {
    old_pid: u32,
    resource: Resource,
}

pub struct SupervisorHandle {
    pub tx: UnboundedSender<Cmd>,
    join: tokio::task::JoinHandle<anyhow::Result<i32>>,
}

impl SupervisorHandle {
    pub async fn status(&self) -> anyhow::Result<Vec<WorkerStatus>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Status { resp: tx })
            .map_err(|_| anyhow::anyhow!("supervisor is gone"))?;
        rx.await.context("supervisor dropped status request")
    }

    /// Wait for the control loop to finish; yields the process exit code.
    pub async fn wait(self) -> anyhow::Result<i32> {
        self.join
            .await
            .map_err(|e| anyhow::anyhow!("supervisor join error: {e}"))?
    }
}

struct Supervisor {
    cfg: MasterConfig,
    sampler: Arc<dyn ProcessSampler>,
    version: VersionGuard,
    pool: Pool,
    sockets: SocketRegistry,
    handles: HashMap<u32, WorkerHandles>,
    generation: u64,
    monitoring_enabled: Arc<AtomicBool>,
    shutting_down: bool,
    pending_respawns: HashSet<usize>,
    pending_replacements: HashMap<u32, ReplacePlan>,
    last_crash: Option<(u32, Option<i32>, Option<i32>)>,
    tx: UnboundedSender<Cmd>,
}

/// Spawn the supervisor control loop. The returned handle is the only way to
/// talk to it; all pool state lives inside the loop task.
pub fn start(cfg: MasterConfig, sampler: Arc<dyn ProcessSampler>) -> anyhow::Result<SupervisorHandle> {
    // Clear a stale socket left by a previous, uncleanly terminated instance
    // before any worker gets a chance to bind it.
    SocketRegistry::clear_stale_bind_path(cfg.bind.as_ref())?;
    let version = VersionGuard::capture()?;

    let (tx, rx) = unbounded_channel::<Cmd>();
    let sup = Supervisor {
        sockets: SocketRegistry::new(cfg.socket_mode),
        cfg,
        sampler,
        version,
        pool: Pool::new(),
        handles: HashMap::new(),
        generation: 0,
        monitoring_enabled: Arc::new(AtomicBool::new(true)),
        shutting_down: false,
        pending_respawns: HashSet::new(),
        pending_replacements: HashMap::new(),
        last_crash: None,
        tx: tx.clone(),
    };
    let join = tokio::spawn(sup.run(rx));
    Ok(SupervisorHandle { tx, join })
}

/// Daemon entry point: build the runtime, wire OS signals into the command
/// channel and run the control loop to completion.
pub fn run_supervisor(cfg: MasterConfig) -> anyhow::Result<i32> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(async move {
        fm_event("boot", None, crate::fm::build_info::banner());
        fm_event(
            "boot",
            None,
            format!(
                "workers={} throttle_ms={} kill_timeout_ms={}",
                cfg.desired_workers,
                cfg.restart_throttle.as_millis(),
                cfg.kill_timeout.as_millis()
            ),
        );
        let handle = start(cfg, Arc::new(SysinfoSampler::new()))?;
        start_signal_listener(handle.tx.clone());
        handle.wait().await
    })
}

fn start_signal_listener(tx: UnboundedSender<Cmd>) {
    tokio::spawn(async move {
        let mut hup = unix_signal(SignalKind::hangup()).expect("SIGHUP handler");
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut usr2 = unix_signal(SignalKind::user_defined2()).expect("SIGUSR2 handler");
        loop {
            let cmd = tokio::select! {
                _ = hup.recv() => Cmd::Reload,
                _ = term.recv() => Cmd::Terminate,
                _ = int.recv() => Cmd::Terminate,
                _ = usr2.recv() => Cmd::ToggleMonitoring,
            };
            if tx.send(cmd).is_err() {
                return;
            }
        }
    });
}

impl Supervisor {
    async fn run(mut self, mut rx: UnboundedReceiver<Cmd>) -> anyhow::Result<i32> {
        for index in 0..self.cfg.desired_workers {
            match self.spawn_worker(index, 0)? {
                Some(_) => {}
                None => anyhow::bail!("failed to spawn initial worker for slot {index}"),
            }
        }

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Cmd::Reload => self.handle_reload()?,
                Cmd::Terminate => {
                    if let Some(code) = self.handle_terminate() {
                        return Ok(code);
                    }
                }
                Cmd::ToggleMonitoring => self.handle_toggle(),
                Cmd::WorkerReady { pid, address } => self.handle_ready(pid, address),
                Cmd::WorkerExited { pid, code, signal } => {
                    if let Some(exit_code) = self.handle_exit(pid, code, signal) {
                        return Ok(exit_code);
                    }
                }
                Cmd::WorkerMessage { pid, msg } => self.handle_worker_message(pid, msg),
                Cmd::RespawnDue { index } => self.handle_respawn_due(index)?,
                Cmd::ReplaceWorker { pid, resource } => self.handle_replace(pid, resource)?,
                Cmd::NotifyWorker { pid, msg } => self.send_to_worker(pid, &msg),
                Cmd::SamplerFailed { error } => {
                    // Flying blind is worse than dying: without metrics we
                    // cannot tell an abusive worker from a healthy one.
                    anyhow::bail!("resource sampling backend failed irrecoverably: {error}");
                }
                Cmd::Status { resp } => {
                    let _ = resp.send(self.snapshot());
                }
            }
        }
        Ok(0)
    }

    /// Fork one worker into `(index, generation)`. `Err` is fatal (stale
    /// binary); `Ok(None)` is a contained spawn failure already logged.
    fn spawn_worker(&mut self, index: usize, generation: u64) -> anyhow::Result<Option<u32>> {
        self.version.ensure_current().map_err(|e| {
            fm_event("version", None, format!("stale_binary err={e:#}"));
            e
        })?;

        let argv = &self.cfg.worker_command;
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("PPID", std::process::id().to_string())
            .env("RELOAD_INDEX", generation.to_string())
            .env("WORKER_INDEX", index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                fm_event(
                    "spawn",
                    None,
                    format!("spawn_failed index={index} generation={generation} err={e}"),
                );
                return Ok(None);
            }
        };
        let Some(pid) = child.id() else {
            fm_event("spawn", None, format!("spawn_failed index={index} reason=no_pid"));
            let _ = child.start_kill();
            return Ok(None);
        };

        fm_event(
            "spawn",
            Some(pid),
            format!("index={index} generation={generation}"),
        );

        // Worker stdout carries NDJSON control messages; anything else is
        // worker log output and gets pumped to our own log.
        let stdout = child.stdout.take();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match ipc::decode_worker_line(&line) {
                    Some(FromWorker::Listening { address }) => {
                        let _ = tx.send(Cmd::WorkerReady { pid, address });
                    }
                    Some(msg) => {
                        let _ = tx.send(Cmd::WorkerMessage { pid, msg });
                    }
                    None => {
                        if !line.trim().is_empty() {
                            fm_event("worker", Some(pid), line);
                        }
                    }
                }
            }
        });

        // Stdin writes go through a channel so a worker that stops reading
        // can never block the control loop.
        let (ipc_tx, mut ipc_rx) = unbounded_channel::<String>();
        let stdin = child.stdin.take();
        tokio::spawn(async move {
            let Some(mut stdin) = stdin else { return };
            while let Some(line) = ipc_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let (code, sig) = match child.wait().await {
                Ok(st) => (st.code(), st.signal()),
                Err(_) => (None, None),
            };
            let _ = tx.send(Cmd::WorkerExited {
                pid,
                code,
                signal: sig,
            });
        });

        let monitor_cancel = Arc::new(AtomicBool::new(false));
        spawn_monitor(
            pid,
            self.cfg.monitor,
            Arc::clone(&self.sampler),
            Arc::clone(&self.monitoring_enabled),
            Arc::clone(&monitor_cancel),
            self.tx.clone(),
        );

        self.pool.insert(WorkerRecord::new(pid, index, generation));
        self.handles.insert(
            pid,
            WorkerHandles {
                ipc_tx,
                kill: None,
                monitor_cancel,
                ready_seen: false,
            },
        );
        Ok(Some(pid))
    }

    /// Rolling reload: bump the generation and spawn one replacement per slot.
    /// Old workers are retired later, by each replacement's readiness event.
    fn handle_reload(&mut self) -> anyhow::Result<()> {
        if self.shutting_down {
            return Ok(());
        }
        self.generation += 1;
        fm_event("reload", None, format!("generation={}", self.generation));
        for index in 0..self.cfg.desired_workers {
            // A failed spawn leaves the slot's old worker serving; the next
            // reload will try again.
            let _ = self.spawn_worker(index, self.generation)?;
        }
        Ok(())
    }

    /// Returns the exit code once the pool has fully drained.
    fn handle_terminate(&mut self) -> Option<i32> {
        if self.shutting_down {
            return None;
        }
        self.shutting_down = true;
        self.pending_respawns.clear();
        fm_event(
            "shutdown",
            None,
            format!("draining workers={}", self.pool.len()),
        );
        if self.pool.is_empty() {
            return Some(self.finish_shutdown());
        }
        for pid in self.pool.pids() {
            self.terminate_worker(pid);
        }
        None
    }

    fn finish_shutdown(&mut self) -> i32 {
        self.sockets.cleanup();
        fm_event("shutdown", None, "done");
        0
    }

    fn handle_toggle(&mut self) {
        let was = self.monitoring_enabled.fetch_xor(true, Ordering::Relaxed);
        fm_event("signal", None, format!("toggle_monitoring enabled={}", !was));
        // The toggle signal is forwarded to every live worker unchanged.
        for pid in self.pool.pids() {
            escalate::send_signal(pid, Signal::SIGUSR2);
        }
    }

    fn handle_ready(&mut self, pid: u32, address: Option<String>) {
        let Some(rec) = self.pool.get(pid) else {
            return;
        };
        let (index, generation) = (rec.index, rec.generation);
        match self.handles.get_mut(&pid) {
            Some(h) if !h.ready_seen => h.ready_seen = true,
            _ => return, // duplicate "listening" or unknown worker
        }
        fm_event(
            "ready",
            Some(pid),
            format!(
                "index={index} generation={generation} address={}",
                address.as_deref().unwrap_or("-")
            ),
        );

        if let Some(addr) = address.as_deref() {
            if addr.starts_with('/') {
                self.sockets.register(PathBuf::from(addr));
            }
        }

        // A forced replacement retires exactly its designated faulty worker,
        // and only now that the successor is serving.
        if let Some(plan) = self.pending_replacements.remove(&pid) {
            self.send_to_worker(
                pid,
                &ToWorker::ReplaceFaultyWorker {
                    reason: format!("used too much {}", plan.resource),
                    old_pid: plan.old_pid,
                    new_pid: pid,
                },
            );
            self.terminate_worker(plan.old_pid);
        }

        // Reload retirement: same slot, strictly older generation.
        for old_pid in self.pool.predecessors_of(index, generation) {
            fm_event(
                "reload",
                Some(old_pid),
                format!("retiring_predecessor index={index} successor={pid}"),
            );
            self.terminate_worker(old_pid);
        }
    }

    /// Mark a worker expected-to-exit and start graceful/forceful escalation.
    fn terminate_worker(&mut self, pid: u32) {
        let Some(rec) = self.pool.get_mut(pid) else {
            return;
        };
        if rec.expected_exit {
            return; // escalation already running
        }
        rec.expected_exit = true;
        let guard = escalate::terminate(pid, self.cfg.kill_timeout);
        if let Some(h) = self.handles.get_mut(&pid) {
            h.kill = Some(guard);
        }
    }

    /// Returns the exit code when this was the last exit of a shutdown.
    fn handle_exit(&mut self, pid: u32, code: Option<i32>, signal: Option<i32>) -> Option<i32> {
        if let Some(h) = self.handles.remove(&pid) {
            h.monitor_cancel.store(true, Ordering::Relaxed);
            // Dropping the handles also drops the kill guard, cancelling any
            // pending SIGKILL.
        }
        // A successor that died before reporting ready will never retire its
        // faulty predecessor; forget the plan.
        self.pending_replacements.remove(&pid);

        let Some(rec) = self.pool.remove(pid) else {
            return None;
        };
        fm_event(
            "exit",
            Some(pid),
            format!(
                "index={} generation={} code={} signal={} expected={}",
                rec.index,
                rec.generation,
                code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                signal.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                rec.expected_exit
            ),
        );

        if self.shutting_down {
            if self.pool.is_empty() {
                return Some(self.finish_shutdown());
            }
            return None;
        }

        if rec.expected_exit {
            // Reload replacement or forced replacement; nothing to do.
            return None;
        }

        // Crash: respawn the slot into the generation current at fire time,
        // throttled so an insta-crashing worker cannot spawn-storm.
        self.last_crash = Some((pid, code, signal));
        let delay = self.cfg.restart_throttle.saturating_sub(rec.uptime());
        fm_event(
            "respawn",
            Some(pid),
            format!("index={} delay_ms={}", rec.index, delay.as_millis()),
        );
        self.schedule_respawn(rec.index, delay);
        None
    }

    fn schedule_respawn(&mut self, index: usize, delay: Duration) {
        if !self.pending_respawns.insert(index) {
            return; // a respawn for this slot is already scheduled
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(Cmd::RespawnDue { index });
        });
    }

    fn handle_respawn_due(&mut self, index: usize) -> anyhow::Result<()> {
        self.pending_respawns.remove(&index);
        if self.shutting_down {
            return Ok(());
        }
        if self.pool.occupied(index, self.generation) {
            // A reload or replacement already converged this slot.
            fm_event("respawn", None, format!("skip index={index} reason=occupied"));
            return Ok(());
        }
        match self.spawn_worker(index, self.generation)? {
            Some(_) => Ok(()),
            None => {
                if self.pool.is_empty() {
                    // Nothing is serving and we cannot spawn: propagate the
                    // crash instead of idling with an empty pool.
                    let crash = self
                        .last_crash
                        .map(|(p, c, s)| format!("pid={p} code={c:?} signal={s:?}"))
                        .unwrap_or_else(|| "unknown".to_string());
                    anyhow::bail!("respawn failed with no live workers (last crash: {crash})");
                }
                self.schedule_respawn(index, self.cfg.restart_throttle);
                Ok(())
            }
        }
    }

    /// Forced replacement after a sustained resource-threshold breach.
    fn handle_replace(&mut self, pid: u32, resource: Resource) -> anyhow::Result<()> {
        if self.shutting_down {
            return Ok(());
        }
        let Some(rec) = self.pool.get(pid) else {
            return Ok(()); // already gone; its exit handler took over
        };
        if rec.expected_exit {
            return Ok(());
        }
        let index = rec.index;
        fm_event(
            "replace",
            Some(pid),
            format!("index={index} reason=used_too_much_{resource}"),
        );
        match self.spawn_worker(index, self.generation)? {
            Some(new_pid) => {
                self.pending_replacements.insert(
                    new_pid,
                    ReplacePlan {
                        old_pid: pid,
                        resource,
                    },
                );
            }
            None => {
                // The old worker keeps serving, now unmonitored; better than a
                // gap. The next reload will still replace it.
                fm_event("replace", Some(pid), "successor_spawn_failed");
            }
        }
        Ok(())
    }

    fn handle_worker_message(&mut self, pid: u32, msg: FromWorker) {
        match msg {
            FromWorker::PauseMonitoring => {
                self.monitoring_enabled.store(false, Ordering::Relaxed);
                fm_event("monitor", Some(pid), "paused_by_worker");
            }
            FromWorker::ResumeMonitoring => {
                self.monitoring_enabled.store(true, Ordering::Relaxed);
                fm_event("monitor", Some(pid), "resumed_by_worker");
            }
            // Listening is routed to WorkerReady by the stdout reader.
            FromWorker::Listening { .. } => {}
        }
    }

    fn send_to_worker(&mut self, pid: u32, msg: &ToWorker) {
        if let Some(h) = self.handles.get(&pid) {
            let _ = h.ipc_tx.send(ipc::encode(msg));
        }
    }

    fn snapshot(&self) -> Vec<WorkerStatus> {
        let mut v: Vec<WorkerStatus> = self
            .pool
            .iter()
            .map(|w| WorkerStatus {
                pid: w.pid,
                index: w.index,
                generation: w.generation,
                uptime: w.uptime(),
                ready: self.handles.get(&w.pid).is_some_and(|h| h.ready_seen),
                expected_exit: w.expected_exit,
            })
            .collect();
        v.sort_by_key(|w| (w.index, w.generation, w.pid));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm::config::BindTarget;
    use crate::fm::monitor::MonitorConfig;
    use std::os::unix::fs::PermissionsExt as _;
    use std::time::Instant;

    fn sh(script: String) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    fn test_cfg(command: Vec<String>) -> MasterConfig {
        MasterConfig {
            worker_command: command,
            desired_workers: 1,
            bind: None,
            restart_throttle: Duration::from_millis(300),
            kill_timeout: Duration::from_secs(2),
            socket_mode: 0o664,
            monitor: MonitorConfig {
                // Long warm-up keeps sampling out of tests that are not about it.
                warmup: Duration::from_secs(120),
                ..MonitorConfig::default()
            },
        }
    }

    fn listening_worker() -> Vec<String> {
        sh(r#"echo '{"msg":"listening"}'; exec sleep 30"#.to_string())
    }

    async fn wait_until<F>(h: &SupervisorHandle, timeout: Duration, mut pred: F) -> Vec<WorkerStatus>
    where
        F: FnMut(&[WorkerStatus]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let st = h.status().await.expect("status");
            if pred(&st) {
                return st;
            }
            assert!(
                Instant::now() < deadline,
                "condition not met in time; last status: {st:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rolling_reload_converges_to_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("spawns.log");
        let script = format!(
            r#"printf '%s %s\n' "$WORKER_INDEX" "$RELOAD_INDEX" >> {log}; echo '{{"msg":"listening"}}'; exec sleep 30"#,
            log = log.display()
        );
        let h = start(test_cfg(sh(script)), Arc::new(SysinfoSampler::new())).unwrap();

        let st = wait_until(&h, Duration::from_secs(5), |st| {
            st.len() == 1 && st[0].ready && st[0].generation == 0
        })
        .await;
        let pid0 = st[0].pid;

        h.tx.send(Cmd::Reload).unwrap();
        let st = wait_until(&h, Duration::from_secs(5), |st| {
            st.len() == 1 && st[0].ready && st[0].generation == 1
        })
        .await;
        assert_ne!(st[0].pid, pid0, "slot must be served by the replacement");
        assert_eq!(st[0].index, 0);

        let spawned = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = spawned.lines().collect();
        assert_eq!(lines, vec!["0 0", "0 1"], "env identity per generation");

        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn predecessor_keeps_serving_until_successor_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let gate = dir.path().join("gate");
        // Generation 1+ workers hold their listening line until the gate
        // file appears, keeping the reload window open.
        let script = format!(
            r#"if [ "$RELOAD_INDEX" != "0" ]; then while [ ! -e {g} ]; do sleep 0.02; done; fi; echo '{{"msg":"listening"}}'; exec sleep 30"#,
            g = gate.display()
        );
        let h = start(test_cfg(sh(script)), Arc::new(SysinfoSampler::new())).unwrap();
        let st = wait_until(&h, Duration::from_secs(5), |st| st.len() == 1 && st[0].ready).await;
        let pid0 = st[0].pid;

        h.tx.send(Cmd::Reload).unwrap();
        wait_until(&h, Duration::from_secs(5), |st| st.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Successor spawned but not ready: the old worker must still be
        // live and untouched, so the slot is never unserved.
        let st = h.status().await.unwrap();
        let old = st
            .iter()
            .find(|w| w.pid == pid0)
            .expect("predecessor left the pool before its successor was ready");
        assert!(old.ready);
        assert!(
            !old.expected_exit,
            "predecessor signaled before the successor reported ready"
        );

        std::fs::write(&gate, b"").unwrap();
        let st = wait_until(&h, Duration::from_secs(5), |st| {
            st.len() == 1 && st[0].ready && st[0].generation == 1
        })
        .await;
        assert_ne!(st[0].pid, pid0);

        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_respawns_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts.log");
        // Crashes immediately; every start appends a nanosecond timestamp.
        let script = format!("date +%s%N >> {}; exit 1", log.display());
        let mut cfg = test_cfg(sh(script));
        cfg.restart_throttle = Duration::from_millis(400);
        let h = start(cfg, Arc::new(SysinfoSampler::new())).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);

        let raw = std::fs::read_to_string(&log).unwrap();
        let times: Vec<u128> = raw.lines().map(|l| l.trim().parse().unwrap()).collect();
        assert!(times.len() >= 2, "expected at least one respawn: {times:?}");
        assert!(
            times.len() <= 6,
            "respawns not throttled: {} starts in 1.5s",
            times.len()
        );
        for pair in times.windows(2) {
            let gap_ms = (pair[1] - pair[0]) / 1_000_000;
            assert!(
                gap_ms >= 300,
                "respawn gap {gap_ms}ms is under the 400ms throttle"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_drains_all_workers_and_exits_zero() {
        // Workers exit non-zero on SIGTERM; a supervisor-initiated stop must
        // still be classified as expected (no respawn, clean exit).
        let script = r#"trap 'exit 3' TERM; echo '{"msg":"listening"}'; while :; do sleep 0.05; done"#;
        let mut cfg = test_cfg(sh(script.to_string()));
        cfg.desired_workers = 3;
        let h = start(cfg, Arc::new(SysinfoSampler::new())).unwrap();

        wait_until(&h, Duration::from_secs(5), |st| {
            st.len() == 3 && st.iter().all(|w| w.ready)
        })
        .await;

        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn socket_files_are_prepared_repaired_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("app.sock");
        std::fs::write(&sock, b"stale leftover").unwrap();

        let script = format!(
            r#"umask 077; : > {p}; echo '{{"msg":"listening","address":"{p}"}}'; exec sleep 30"#,
            p = sock.display()
        );
        let mut cfg = test_cfg(sh(script));
        cfg.bind = Some(BindTarget::Path(sock.clone()));
        let h = start(cfg, Arc::new(SysinfoSampler::new())).unwrap();

        wait_until(&h, Duration::from_secs(5), |st| st.len() == 1 && st[0].ready).await;

        // The stale file was unlinked before spawn and recreated by the
        // worker with a restrictive umask; the registry repairs the bits.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let mode = std::fs::metadata(&sock).unwrap().permissions().mode() & 0o777;
            if mode == 0o664 {
                break;
            }
            assert!(Instant::now() < deadline, "socket mode never repaired: {mode:o}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
        assert!(!sock.exists(), "registered socket must be unlinked at shutdown");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resource_abuse_forces_replacement_within_same_generation() {
        let mut cfg = test_cfg(listening_worker());
        cfg.monitor = MonitorConfig {
            warmup: Duration::from_millis(50),
            interval: Duration::from_millis(30),
            max_memory_bytes: 1, // any real process trips this immediately
            max_memory_violations: 2,
            cpu_threshold: 95.0,
            max_cpu_violations: 10,
        };
        let h = start(cfg, Arc::new(SysinfoSampler::new())).unwrap();

        let st = wait_until(&h, Duration::from_secs(5), |st| {
            st.len() == 1 && st[0].ready
        })
        .await;
        let pid0 = st[0].pid;

        // Monitor trips, a successor spawns, reports ready, the old worker is
        // retired. The pool converges back to one worker in generation 0.
        let st = wait_until(&h, Duration::from_secs(10), |st| {
            st.len() == 1 && st[0].ready && st[0].pid != pid0 && !st[0].expected_exit
        })
        .await;
        assert_eq!(st[0].generation, 0, "replacement stays in the current generation");

        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_messages_pause_and_resume_monitoring() {
        let h = start(test_cfg(listening_worker()), Arc::new(SysinfoSampler::new())).unwrap();
        let st = wait_until(&h, Duration::from_secs(5), |st| st.len() == 1 && st[0].ready).await;
        let pid = st[0].pid;

        h.tx.send(Cmd::WorkerMessage {
            pid,
            msg: FromWorker::PauseMonitoring,
        })
        .unwrap();
        h.tx.send(Cmd::WorkerMessage {
            pid,
            msg: FromWorker::ResumeMonitoring,
        })
        .unwrap();

        // Both commands are processed in order before the status reply.
        let _ = h.status().await.unwrap();
        h.tx.send(Cmd::Terminate).unwrap();
        assert_eq!(h.wait().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sampler_backend_failure_is_fatal() {
        let h = start(test_cfg(listening_worker()), Arc::new(SysinfoSampler::new())).unwrap();
        wait_until(&h, Duration::from_secs(5), |st| st.len() == 1 && st[0].ready).await;

        h.tx.send(Cmd::SamplerFailed {
            error: "proc table unreadable".to_string(),
        })
        .unwrap();
        let err = h.wait().await.unwrap_err();
        assert!(err.to_string().contains("sampling backend"));
    }

    #[test]
    fn stale_bind_path_is_cleared_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("stale.sock");
        std::fs::write(&sock, b"x").unwrap();
        SocketRegistry::clear_stale_bind_path(Some(&BindTarget::Path(sock.clone()))).unwrap();
        assert!(!sock.exists());
    }
}
