use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::logging;
use crate::snap::paths::PathOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "snapsplit",
    version,
    about = "Split a chat export into per-day conversation files with linked media"
)]
struct Cli {
    /// Debug logging (overridden by SNAPSPLIT_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract the export, match media to messages and write the output tree
    Split {
        /// Directory holding the export zip files
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output root
        #[arg(long)]
        output: Option<PathBuf>,
        /// Scratch directory for extracted files
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Leave the scratch directory in place afterwards
        #[arg(long)]
        keep_work_dir: bool,
        /// Skip extraction and read a previously kept scratch directory
        #[arg(long)]
        reuse_work_dir: bool,
        /// Do not synthesize avatars
        #[arg(long)]
        no_avatars: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show resolved paths, configuration and lock state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Synthesize avatars for the given usernames
    Avatars {
        #[arg(required = true)]
        usernames: Vec<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{} {}", report.command, if report.ok { "ok" } else { "failed" });
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let (report, json) = match cli.command {
        Command::Split {
            input,
            output,
            work_dir,
            keep_work_dir,
            reuse_work_dir,
            no_avatars,
            json,
        } => {
            let opts = commands::split::SplitOptions {
                paths: PathOverrides {
                    input_dir: input,
                    work_dir,
                    output_dir: output,
                },
                keep_work_dir,
                reuse_work_dir,
                no_avatars,
            };
            (commands::split::run(&opts)?, json)
        }
        Command::Status { json } => (commands::status::run()?, json),
        Command::Avatars {
            usernames,
            output,
            json,
        } => (commands::avatars::run(&usernames, output)?, json),
    };

    print_report(&report, json)?;
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
