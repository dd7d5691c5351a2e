use crate::fm::monitor::MonitorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the workers listen. A filesystem path enables the socket registry
/// (stale-file cleanup, permission repair, unlink at shutdown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Port(u16),
    Path(PathBuf),
}

/// Pool size spec: a plain number, or `AUTO` / `AUTO-1` for core-count-derived sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    Fixed(usize),
    AllCores,
    AllCoresMinusOne,
}

impl WorkerCount {
    pub fn resolve(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            WorkerCount::Fixed(n) => (*n).max(1),
            WorkerCount::AllCores => cores,
            WorkerCount::AllCoresMinusOne => cores.saturating_sub(1).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Worker command argv list. Workers inherit PPID/RELOAD_INDEX/WORKER_INDEX env vars.
    pub worker_command: Vec<String>,
    pub desired_workers: usize,
    pub bind: Option<BindTarget>,
    /// Minimum spacing between successive crash respawns of one slot.
    pub restart_throttle: Duration,
    /// Grace window between SIGTERM and SIGKILL during termination.
    pub kill_timeout: Duration,
    /// Permission bits applied to worker-bound unix socket files.
    pub socket_mode: u32,
    pub monitor: MonitorConfig,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    workers: WorkersSection,
    #[serde(default)]
    restart: Option<RestartSection>,
    #[serde(default)]
    monitor: Option<MonitorSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkersSection {
    /// Command argv list.
    command: Vec<String>,
    #[serde(default = "default_count", deserialize_with = "deserialize_worker_count")]
    count: WorkerCount,
    #[serde(default, deserialize_with = "deserialize_bind_opt")]
    bind: Option<BindTarget>,
    /// Socket file mode (octal), e.g. 664 or "0664".
    #[serde(default = "default_socket_mode", deserialize_with = "deserialize_mode_octal")]
    socket_mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestartSection {
    /// Duration string like "300ms" or "1s".
    #[serde(default)]
    throttle: Option<String>,
    #[serde(default)]
    kill_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorSection {
    #[serde(default)]
    warmup: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    /// Absolute memory ceiling, e.g. "450MB" or "1.2GB". Default is arch-dependent.
    #[serde(default)]
    max_memory: Option<String>,
    #[serde(default)]
    memory_violations: Option<u32>,
    /// CPU percentage above which a sample counts as a violation.
    #[serde(default)]
    cpu_threshold: Option<f32>,
    #[serde(default)]
    cpu_violations: Option<u32>,
}

fn default_count() -> WorkerCount {
    WorkerCount::Fixed(1)
}

fn default_socket_mode() -> u32 {
    0o664
}

fn default_restart_throttle() -> Duration {
    Duration::from_secs(1)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

fn deserialize_worker_count<'de, D>(deserializer: D) -> Result<WorkerCount, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => {
            let u = n
                .as_u64()
                .filter(|u| *u > 0)
                .ok_or_else(|| D::Error::custom("workers.count must be a positive integer"))?;
            Ok(WorkerCount::Fixed(u as usize))
        }
        serde_yaml::Value::String(s) => parse_worker_count(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "workers.count must be a positive integer or \"AUTO\" / \"AUTO-1\"",
        )),
    }
}

pub(crate) fn parse_worker_count(s: &str) -> Result<WorkerCount, String> {
    let t = s.trim().to_ascii_uppercase();
    if t == "AUTO" {
        return Ok(WorkerCount::AllCores);
    }
    if t == "AUTO-1" {
        return Ok(WorkerCount::AllCoresMinusOne);
    }
    match t.parse::<usize>() {
        Ok(n) if n > 0 => Ok(WorkerCount::Fixed(n)),
        _ => Err(format!("invalid workers.count: {s:?} (use a number, AUTO or AUTO-1)")),
    }
}

fn deserialize_bind_opt<'de, D>(deserializer: D) -> Result<Option<BindTarget>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let Some(v) = v else { return Ok(None) };
    match v {
        serde_yaml::Value::Number(n) => {
            let p = n
                .as_u64()
                .and_then(|u| u16::try_from(u).ok())
                .ok_or_else(|| D::Error::custom("workers.bind port out of range"))?;
            Ok(Some(BindTarget::Port(p)))
        }
        serde_yaml::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Ok(None);
            }
            if t.starts_with('/') {
                return Ok(Some(BindTarget::Path(PathBuf::from(t))));
            }
            let p: u16 = t
                .parse()
                .map_err(|e| D::Error::custom(format!("invalid workers.bind {t:?}: {e}")))?;
            Ok(Some(BindTarget::Port(p)))
        }
        _ => Err(D::Error::custom(
            "workers.bind must be a TCP port or an absolute filesystem path",
        )),
    }
}

fn deserialize_mode_octal<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => {
            // YAML numbers arrive base-10: `664` means 0o664.
            let u = n
                .as_u64()
                .ok_or_else(|| D::Error::custom("socket_mode must be a non-negative integer"))?;
            u32::from_str_radix(&u.to_string(), 8)
                .map_err(|e| D::Error::custom(format!("invalid socket_mode {u}: {e}")))
        }
        serde_yaml::Value::String(s) => {
            let t = s.trim();
            let t = t.strip_prefix("0o").unwrap_or(t);
            u32::from_str_radix(t, 8)
                .map_err(|e| D::Error::custom(format!("invalid socket_mode {s:?}: {e}")))
        }
        _ => Err(D::Error::custom("socket_mode must be an integer or octal string like \"0664\"")),
    }
}

pub(crate) fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    // e.g. 1000ms, 10s, 1m, 2h
    let mut idx = 0usize;
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    if num < 0.0 {
        return Err("duration must be >= 0".to_string());
    }
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok(Duration::from_millis((num * mult).round() as u64))
}

pub(crate) fn parse_size_spec_bytes(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    if t.is_empty() {
        anyhow::bail!("empty size");
    }
    // plain integer
    if t.chars().all(|c| c.is_ascii_digit()) {
        return Ok(t.parse()?);
    }
    // split numeric + unit
    let mut idx = 0usize;
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        anyhow::bail!("invalid size: {s}");
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse()?;
    if num < 0.0 {
        anyhow::bail!("size must be >= 0");
    }
    // Units: k/m/g/t are base10, ki/mi/gi/ti base2, optional trailing b, case-insensitive.
    let mut unit = unit_s.trim().to_ascii_lowercase();
    if unit.ends_with('b') {
        unit.pop();
    }
    let mult: f64 = match unit.as_str() {
        "" => 1.0,
        "k" => 1000.0,
        "m" => 1000.0_f64.powi(2),
        "g" => 1000.0_f64.powi(3),
        "t" => 1000.0_f64.powi(4),
        "ki" => 1024.0,
        "mi" => 1024.0_f64.powi(2),
        "gi" => 1024.0_f64.powi(3),
        "ti" => 1024.0_f64.powi(4),
        _ => anyhow::bail!("unknown size unit: {unit_s} (try k/m/g/t or ki/mi/gi/ti, optional b)"),
    };
    Ok((num * mult).round() as u64)
}

impl MasterConfigFile {
    fn into_config(self) -> anyhow::Result<MasterConfig> {
        anyhow::ensure!(
            !self.workers.command.is_empty(),
            "workers.command must not be empty"
        );

        let restart = self.restart.unwrap_or(RestartSection {
            throttle: None,
            kill_timeout: None,
        });
        let restart_throttle = match restart.throttle.as_deref() {
            None => default_restart_throttle(),
            Some(s) => parse_duration_str(s)
                .map_err(|e| anyhow::anyhow!("invalid restart.throttle {s:?}: {e}"))?,
        };
        let kill_timeout = match restart.kill_timeout.as_deref() {
            None => default_kill_timeout(),
            Some(s) => parse_duration_str(s)
                .map_err(|e| anyhow::anyhow!("invalid restart.kill_timeout {s:?}: {e}"))?,
        };

        let mon = self.monitor.unwrap_or(MonitorSection {
            warmup: None,
            interval: None,
            max_memory: None,
            memory_violations: None,
            cpu_threshold: None,
            cpu_violations: None,
        });
        let mut mc = MonitorConfig::default();
        if let Some(s) = mon.warmup.as_deref() {
            mc.warmup = parse_duration_str(s)
                .map_err(|e| anyhow::anyhow!("invalid monitor.warmup {s:?}: {e}"))?;
        }
        if let Some(s) = mon.interval.as_deref() {
            mc.interval = parse_duration_str(s)
                .map_err(|e| anyhow::anyhow!("invalid monitor.interval {s:?}: {e}"))?;
        }
        if let Some(s) = mon.max_memory.as_deref() {
            mc.max_memory_bytes = parse_size_spec_bytes(s)
                .map_err(|e| anyhow::anyhow!("invalid monitor.max_memory {s:?}: {e}"))?;
            anyhow::ensure!(mc.max_memory_bytes > 0, "monitor.max_memory must be > 0");
        }
        if let Some(n) = mon.memory_violations {
            anyhow::ensure!(n > 0, "monitor.memory_violations must be > 0");
            mc.max_memory_violations = n;
        }
        if let Some(p) = mon.cpu_threshold {
            anyhow::ensure!(
                p > 0.0 && p <= 100.0,
                "monitor.cpu_threshold must be in (0, 100]"
            );
            mc.cpu_threshold = p;
        }
        if let Some(n) = mon.cpu_violations {
            anyhow::ensure!(n > 0, "monitor.cpu_violations must be > 0");
            mc.max_cpu_violations = n;
        }
        Ok(MasterConfig {
            worker_command: self.workers.command,
            desired_workers: self.workers.count.resolve(),
            bind: self.workers.bind,
            restart_throttle,
            kill_timeout,
            socket_mode: self.workers.socket_mode,
            monitor: mc,
        })
    }
}

pub fn load_master_config(path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    parse_master_config(&raw)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))
}

pub fn parse_master_config(raw: &str) -> anyhow::Result<MasterConfig> {
    let file: MasterConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("parse error: {e}"))?;
    file.into_config()
}
