use crate::fm::fm_event;
use crate::fm::ipc::ToWorker;
use crate::fm::supervisor::Cmd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::sync::mpsc::UnboundedSender;

/// Which resource tripped the consecutive-violation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Cpu,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory => write!(f, "memory"),
            Resource::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug)]
pub enum SampleError {
    /// The process vanished mid-sample (or we lost permission to it).
    /// Monitoring for that worker stops silently.
    Gone,
    /// The sampling backend itself failed. The supervisor cannot operate
    /// blind; this is fatal to the whole process.
    Backend(anyhow::Error),
}

/// Platform process-metrics lookup, injected so the supervisor logic does not
/// depend on a specific sampling technique.
pub trait ProcessSampler: Send + Sync + 'static {
    fn sample(&self, pid: u32) -> Result<Usage, SampleError>;
}

/// Production sampler backed by sysinfo. The `System` is kept across samples
/// so per-process CPU percentages are computed against the previous refresh.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Result<Usage, SampleError> {
        let mut sys = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let spid = SysPid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
        let proc_info = sys.process(spid).ok_or(SampleError::Gone)?;
        Ok(Usage {
            cpu_percent: proc_info.cpu_usage(),
            memory_bytes: proc_info.memory(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    /// Delay before sampling starts, so process-startup/JIT CPU bursts are not
    /// counted as abuse.
    pub warmup: Duration,
    pub interval: Duration,
    pub max_memory_bytes: u64,
    pub max_memory_violations: u32,
    pub cpu_threshold: f32,
    pub max_cpu_violations: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(30),
            interval: Duration::from_secs(2),
            max_memory_bytes: default_max_memory_bytes(),
            max_memory_violations: 10,
            cpu_threshold: 95.0,
            max_cpu_violations: 10,
        }
    }
}

/// Arch-dependent default ceiling, matching common per-process heap defaults:
/// smaller on 32-bit targets, larger on 64-bit.
pub fn default_max_memory_bytes() -> u64 {
    if cfg!(target_pointer_width = "32") {
        450_000_000 // 450 MB
    } else {
        1_200_000_000 // 1.2 GB
    }
}

/// Per-worker consecutive-violation counters. A sample under threshold resets
/// the respective counter to zero.
#[derive(Debug, Default)]
pub(crate) struct ViolationCounters {
    mem: u32,
    cpu: u32,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct TickOutcome {
    pub replace: Option<Resource>,
    pub mem_high: Option<f64>,
}

impl ViolationCounters {
    /// Memory is checked first and a memory trip short-circuits the tick;
    /// otherwise the >80% advisory fires and the CPU check runs.
    pub(crate) fn observe(&mut self, u: &Usage, cfg: &MonitorConfig) -> TickOutcome {
        let mut out = TickOutcome::default();

        if u.memory_bytes > cfg.max_memory_bytes {
            self.mem += 1;
            if self.mem >= cfg.max_memory_violations {
                out.replace = Some(Resource::Memory);
                return out;
            }
        } else {
            self.mem = 0;
        }

        let mem_perc = u.memory_bytes as f64 * 100.0 / cfg.max_memory_bytes as f64;
        if mem_perc > 80.0 {
            out.mem_high = Some(mem_perc);
        }

        if u.cpu_percent > cfg.cpu_threshold {
            self.cpu += 1;
            if self.cpu >= cfg.max_cpu_violations {
                out.replace = Some(Resource::Cpu);
                return out;
            }
        } else {
            self.cpu = 0;
        }

        out
    }
}

/// Watch one worker until it dies, is replaced, or monitoring is cancelled.
///
/// The task holds only the worker's pid and a cancel flag, never the record
/// itself; the supervisor flips `cancel` the moment the worker is known dead.
pub(crate) fn spawn_monitor(
    pid: u32,
    cfg: MonitorConfig,
    sampler: Arc<dyn ProcessSampler>,
    enabled: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    tx: UnboundedSender<Cmd>,
) {
    tokio::spawn(async move {
        tokio::time::sleep(cfg.warmup).await;
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        fm_event("monitor", Some(pid), "started");

        let mut counters = ViolationCounters::default();
        loop {
            tokio::time::sleep(cfg.interval).await;
            if cancel.load(Ordering::Relaxed) {
                fm_event("monitor", Some(pid), "stopped reason=worker_gone");
                return;
            }
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }

            let usage = match sampler.sample(pid) {
                Ok(u) => u,
                Err(SampleError::Gone) => {
                    fm_event("monitor", Some(pid), "stopped reason=process_vanished");
                    return;
                }
                Err(SampleError::Backend(e)) => {
                    let _ = tx.send(Cmd::SamplerFailed {
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let out = counters.observe(&usage, &cfg);
            if let Some(mem_perc) = out.mem_high {
                let _ = tx.send(Cmd::NotifyWorker {
                    pid,
                    msg: ToWorker::MemHigh { mem_perc },
                });
            }
            if let Some(resource) = out.replace {
                fm_event(
                    "monitor",
                    Some(pid),
                    format!(
                        "violation_limit_reached resource={resource} cpu={:.0} mem={}",
                        usage.cpu_percent, usage.memory_bytes
                    ),
                );
                let _ = tx.send(Cmd::ReplaceWorker { pid, resource });
                return;
            }
        }
    });
}
