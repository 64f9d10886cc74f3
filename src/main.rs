//! minihv CLI
//!
//! Runs one flat guest binary per `--guest` path, each on its own VM and
//! thread, sharing the files listed after `--file`.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use minihv::{MemorySize, PageSize, VMRunner, VmConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "minihv", version)]
#[command(about = "Run flat bare-metal guests on KVM with paravirtual console and file ports", long_about = None)]
struct Cli {
    /// Guest memory in MiB (2, 4 or 8)
    #[arg(short, long, value_parser = parse_memory)]
    memory: MemorySize,

    /// Page size: 2 for 2 MiB pages, 4 for 4 KiB pages
    #[arg(short, long, value_parser = parse_page)]
    page: PageSize,

    /// Guest images to run, one VM each
    #[arg(short, long, value_name = "IMAGE", num_args = 1.., required = true)]
    guest: Vec<PathBuf>,

    /// Files shared by all guests (copy-on-write on first write)
    #[arg(short, long, value_name = "NAME", num_args = 1..)]
    file: Vec<String>,

    /// Directory holding guest-private files
    #[arg(long, value_name = "DIR", default_value = ".")]
    private_dir: PathBuf,

    /// Print one JSON result line per guest when all have stopped
    #[arg(long)]
    json: bool,
}

fn parse_memory(s: &str) -> Result<MemorySize, String> {
    s.parse::<u32>()
        .ok()
        .and_then(MemorySize::from_mib)
        .ok_or_else(|| format!("unsupported memory size {:?} (expected 2, 4 or 8)", s))
}

fn parse_page(s: &str) -> Result<PageSize, String> {
    s.parse::<u32>()
        .ok()
        .and_then(PageSize::from_selector)
        .ok_or_else(|| format!("unsupported page size {:?} (expected 2 or 4)", s))
}

impl Cli {
    fn into_config(self) -> VmConfig {
        let mut config = VmConfig::new(self.memory, self.page);
        config.guests = self.guest;
        config.shared_files = self.file;
        config.private_dir = self.private_dir;
        config
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let json = cli.json;
    let config = cli.into_config();
    if let Err(e) = config.validate() {
        Cli::command().error(ErrorKind::ValueValidation, e).exit();
    }

    if let Err(e) = run(config, json) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: VmConfig, json: bool) -> Result<()> {
    let runner = VMRunner::new(config).context("invalid configuration")?;
    let results = runner.run();
    if json {
        for res in &results {
            println!("{}", serde_json::to_string(res).context("serializing run result")?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_invocation() {
        let cli = Cli::try_parse_from([
            "minihv", "-m", "4", "-p", "2", "-g", "guest1/guest1.img", "guest2/guest2.img", "-f",
            "lorem1.txt", "lorem2.txt",
        ])
        .unwrap();
        let cfg = cli.into_config();
        assert_eq!(cfg.machine.memory, MemorySize::Mib4);
        assert_eq!(cfg.machine.page_size, PageSize::Large2M);
        assert_eq!(cfg.guests.len(), 2);
        assert_eq!(cfg.shared_files, vec!["lorem1.txt", "lorem2.txt"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn long_flags_and_no_shared_files() {
        let cli = Cli::try_parse_from([
            "minihv", "--memory", "8", "--page", "4", "--guest", "g.img",
        ])
        .unwrap();
        assert!(cli.file.is_empty());
        assert_eq!(cli.page, PageSize::Small4K);
    }

    #[test]
    fn unsupported_values_are_usage_errors() {
        let page3 = Cli::try_parse_from(["minihv", "-m", "2", "-p", "3", "-g", "g.img"]);
        assert_eq!(page3.unwrap_err().kind(), ErrorKind::ValueValidation);
        let mem16 = Cli::try_parse_from(["minihv", "-m", "16", "-p", "2", "-g", "g.img"]);
        assert!(mem16.is_err());
        let no_guest = Cli::try_parse_from(["minihv", "-m", "2", "-p", "2"]);
        assert!(no_guest.is_err());
    }

    #[test]
    fn duplicate_guests_fail_validation() {
        let cli = Cli::try_parse_from(["minihv", "-m", "2", "-p", "2", "-g", "a.img", "a.img"]).unwrap();
        assert!(cli.into_config().validate().is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
