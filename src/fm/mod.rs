pub mod build_info;
pub mod cli;
pub mod config;
pub mod escalate;
pub mod ipc;
pub mod monitor;
pub mod sockets;
pub mod supervisor;
pub mod version;
pub mod worker;

use chrono::Local;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}

/// Structured event line on stderr: `TS [component] pid=N key=value ...`.
///
/// Every component logs through this so operator output stays greppable.
pub(crate) fn fm_event(component: &str, pid: Option<u32>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match pid {
        Some(p) => eprintln!("{ts} [{component}] pid={p} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}
