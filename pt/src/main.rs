//! pt - PRD backlog inspection CLI

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};

use prdtrack::cli::{Cli, Command};
use prdtrack::{GithubOptions, TrackerOptions, make_tracker};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let prd_path = if cli.prd.is_absolute() {
        cli.prd.clone()
    } else {
        cwd.join(&cli.prd)
    };

    let tracker = make_tracker(&TrackerOptions {
        kind: cli.kind.clone(),
        prd_path,
        project_root: cwd,
        github: GithubOptions::default(),
    })
    .map_err(|e| eyre!("{e}"))?;

    match cli.command {
        Command::Next => match tracker.claim_next_task() {
            Some(task) => {
                println!("{} {}", task.id.cyan(), task.title);
                for item in &task.acceptance {
                    println!("  - {item}");
                }
                if !task.depends_on.is_empty() {
                    println!("  depends on: {}", task.depends_on.join(", "));
                }
            }
            None => println!("{}", "no selectable task".dimmed()),
        },
        Command::Counts => {
            let (done, total) = tracker.counts();
            println!("{done}/{total} done");
        }
        Command::Groups => {
            let groups = tracker.get_parallel_groups();
            if groups.is_empty() {
                println!("{}", "no parallel groups (tracker is sequential)".dimmed());
            }
            for (name, tasks) in groups {
                println!("{}", name.green());
                for task in tasks {
                    println!("  {} {}", task.id.cyan(), task.title);
                }
            }
        }
        Command::Branch => match tracker.branch_name() {
            Some(branch) => println!("{branch}"),
            None => println!("{}", "no branch declared".dimmed()),
        },
    }

    Ok(())
}
