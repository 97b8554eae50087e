//! Scenario runner for the userfs engine.
//!
//! Runs end-to-end scenario groups against the engine with an in-memory
//! file system, for quick smoke-testing outside the unit suites:
//!
//! ```text
//! userfs-tests run            # everything
//! userfs-tests run streams    # one group
//! userfs-tests list
//! ```

mod memfs;
mod scenarios;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use log::error;
use log::info;

#[derive(Parser)]
#[command(name = "userfs-tests", about = "Scenario runner for userfs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scenario groups (all of them when none are named).
    Run {
        /// Scenario group names.
        groups: Vec<String>,
    },
    /// List the available scenario groups.
    List,
}

const GROUPS: &[(&str, fn() -> Result<()>)] = &[
    ("streams", scenarios::streams),
    ("cross-stream-sharing", scenarios::cross_stream_sharing),
    ("rename", scenarios::rename_subtree),
    ("append", scenarios::concurrent_append),
    ("lifecycle", scenarios::lifecycle),
];

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for (name, _) in GROUPS {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run { groups } => {
            let selected: Vec<(&str, fn() -> Result<()>)> = if groups.is_empty() {
                GROUPS.to_vec()
            } else {
                let mut selected = Vec::new();
                for wanted in &groups {
                    match GROUPS.iter().find(|(name, _)| *name == wanted.as_str()) {
                        Some(group) => selected.push(*group),
                        None => bail!("unknown scenario group {wanted:?}"),
                    }
                }
                selected
            };

            let mut failures = 0;
            for (name, run) in selected {
                info!("running {name}");
                if let Err(err) = run() {
                    error!("{name} failed: {err:#}");
                    failures += 1;
                }
            }
            if failures > 0 {
                bail!("{failures} scenario group(s) failed");
            }
            info!("all scenario groups passed");
            Ok(())
        }
    }
}
