use crate::fm::{build_info, config, supervisor};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "forkmaster", version, about = "worker pool supervisor")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "forkmaster.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Print build information and exit
    Version,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Some(Cmd::Version) => {
            println!("{}", build_info::banner());
            Ok(())
        }
        None => {
            let cfg = config::load_master_config(&args.config)?;
            let code = supervisor::run_supervisor(cfg)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn args_parse() {
        Args::command().debug_assert();
        let a = Args::parse_from(["forkmaster", "-c", "/etc/forkmaster.yaml"]);
        assert_eq!(a.config, PathBuf::from("/etc/forkmaster.yaml"));
        assert!(a.cmd.is_none());

        let a = Args::parse_from(["forkmaster"]);
        assert_eq!(a.config, PathBuf::from("forkmaster.yaml"));

        let a = Args::parse_from(["forkmaster", "version"]);
        assert!(matches!(a.cmd, Some(Cmd::Version)));
    }
}
