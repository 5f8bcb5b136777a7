//! Build automation tasks for the dbgate workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for dbgate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test)
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on all targets
    Clippy,
    /// Run all tests
    Test,
    /// Rerun the multi-threaded race tests
    Stress {
        /// Number of runs
        #[arg(long, default_value_t = 20)]
        runs: u32,
        /// Only run race tests whose name contains this
        #[arg(long)]
        only: Option<String>,
    },
    /// Generate documentation
    Doc,
}

/// Integration tests that race worker threads against each other, as
/// (test target, test name).
const RACE_TESTS: &[(&str, &str)] = &[
    ("zombie_reclaim", "test_concurrent_workers_release_each_dcb_exactly_once"),
    ("persistent_pool", "test_hangups_racing_checkouts_are_never_lost"),
];

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test => test(&sh)?,
        Command::Stress { runs, only } => stress(&sh, runs, only.as_deref())?,
        Command::Doc => doc(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    println!("Formatting check passed.");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("Clippy check passed.");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("Running tests...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("All tests passed.");
    Ok(())
}

fn stress(sh: &Shell, runs: u32, only: Option<&str>) -> Result<()> {
    let selected: Vec<_> = RACE_TESTS
        .iter()
        .filter(|(_, name)| only.is_none_or(|filter| name.contains(filter)))
        .collect();
    anyhow::ensure!(!selected.is_empty(), "no race test matches {only:?}");

    for &&(target, name) in &selected {
        println!("Running {target}::{name} {runs} times...");
        for run in 1..=runs {
            cmd!(
                sh,
                "cargo test -p dbgate-testing --test {target} --release -q -- --exact {name}"
            )
            .run()
            .with_context(|| format!("{name}: run {run} of {runs} failed"))?;
        }
    }
    println!("Stress runs passed.");
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Generating documentation...");
    cmd!(sh, "cargo doc --workspace --no-deps").run()?;
    println!("Documentation generated.");
    Ok(())
}
