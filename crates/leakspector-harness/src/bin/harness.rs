//! Command-line front end for the fixture runner: replays the engine's
//! builtin scenarios, or a fixture file captured from a previous run,
//! printing a pass/fail report and exiting non-zero on any failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use leakspector_harness::{fixtures, TestRunner};

#[derive(Parser)]
#[command(name = "harness", about = "Scenario runner for the leakspector engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fixture set and print a pass/fail report.
    Run {
        /// Path to a fixture-set JSON file; the builtin set runs if omitted.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Name attached to the report's campaign field.
        #[arg(long, default_value = "harness")]
        campaign: String,
        /// Print the report as JSON instead of the default terminal format.
        #[arg(long)]
        json: bool,
    },
    /// List the cases in a fixture set without running them.
    List {
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { fixtures, campaign, json } => {
            let set = match load(fixtures) {
                Ok(set) => set,
                Err(message) => {
                    eprintln!("{message}");
                    return std::process::ExitCode::FAILURE;
                }
            };
            let report = TestRunner::new(campaign).run(&set);
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(err) => eprintln!("failed to serialize report: {err}"),
                }
            } else {
                print!("{}", report.render());
            }
            if report.all_passed() {
                std::process::ExitCode::SUCCESS
            } else {
                std::process::ExitCode::FAILURE
            }
        }
        Command::List { fixtures } => {
            let set = match load(fixtures) {
                Ok(set) => set,
                Err(message) => {
                    eprintln!("{message}");
                    return std::process::ExitCode::FAILURE;
                }
            };
            for case in &set.cases {
                println!("{}: {}", case.name, case.description);
            }
            std::process::ExitCode::SUCCESS
        }
    }
}

fn load(path: Option<PathBuf>) -> Result<fixtures::FixtureSet, String> {
    match path {
        Some(path) => fixtures::FixtureSet::from_file(&path).map_err(|err| format!("reading {}: {err}", path.display())),
        None => Ok(fixtures::builtin()),
    }
}
