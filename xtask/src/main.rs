use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for worldstore")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all checks: fmt, clippy, tests, doc
    Check,
    /// Run cargo fmt --check on all crates
    Fmt,
    /// Run clippy on all crates
    Clippy,
    /// Run tests, optionally for one crate
    Test {
        /// Package to test, e.g. worldstore-history
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Run the persistence benchmarks in release mode
    Bench,
    /// Build rustdoc for the workspace
    Doc,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            run_fmt()?;
            run_clippy()?;
            run_tests(None)?;
            run_doc()?;
        }
        Commands::Fmt => run_fmt()?,
        Commands::Clippy => run_clippy()?,
        Commands::Test { package } => run_tests(package.as_deref())?,
        Commands::Bench => run_bench()?,
        Commands::Doc => run_doc()?,
    }

    Ok(())
}

/// Run `cargo <args>` and fail with `what` if it exits unsuccessfully.
fn cargo(what: &str, args: &[&str]) -> Result<()> {
    println!("==> Running cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn run_fmt() -> Result<()> {
    cargo("cargo fmt check", &["fmt", "--all", "--", "--check"])
}

fn run_clippy() -> Result<()> {
    cargo(
        "cargo clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )
}

fn run_tests(package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => cargo("cargo test", &["test", "-p", package]),
        None => cargo("cargo test", &["test", "--workspace"]),
    }
}

fn run_bench() -> Result<()> {
    cargo(
        "cargo bench",
        &["bench", "-p", "worldstore-persist", "--bench", "bench_sector_alloc"],
    )
}

fn run_doc() -> Result<()> {
    cargo("cargo doc", &["doc", "--workspace", "--no-deps"])
}
