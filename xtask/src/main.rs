use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run every test in the workspace
    Test,
    /// Build a sample upgrade file and run it through the simulator
    Simulate {
        /// Also relay the upgrade to a secondary earbud
        #[arg(long)]
        peer: bool,
        /// Power-cycle the device after this many bytes
        #[arg(long)]
        interrupt_at: Option<u64>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn dfu(args: &[&str]) -> Result<()> {
    let mut full = vec!["run", "-q", "-p", "dfu-cli", "--"];
    full.extend_from_slice(args);
    cargo(&full, "dfu")
}

/// Sample partition images: an application and a data blob.
fn write_images(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let app: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let data = vec![0x5Au8; 3_000];
    let app_path = dir.join("app.bin");
    let data_path = dir.join("data.bin");
    std::fs::write(&app_path, app)?;
    std::fs::write(&data_path, data)?;
    Ok((app_path, data_path))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Simulate { peer, interrupt_at } => {
            let dir = PathBuf::from("target").join("xtask-sim");
            let (app, data) = write_images(&dir)?;
            let output = dir.join("upgrade.bin");
            let app_arg = format!("0={}", app.display());
            let data_arg = format!("1={}", data.display());
            let output_arg = output.display().to_string();

            println!("Building sample upgrade file...");
            dfu(&["build", "--partition", &app_arg, "--partition", &data_arg, "-o", &output_arg])?;
            dfu(&["inspect", &output_arg])?;

            println!("Simulating...");
            let interrupt = interrupt_at.map(|n| n.to_string());
            let mut args = vec!["simulate", output_arg.as_str()];
            if *peer {
                args.push("--peer");
            }
            if let Some(n) = &interrupt {
                args.extend_from_slice(&["--interrupt-at", n.as_str()]);
            }
            dfu(&args)?;
        }
    }

    Ok(())
}
