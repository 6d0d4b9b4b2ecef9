use anyhow::Result;
use clap::{Parser, Subcommand};
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
    /// Build the workspace
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Run every test of the workspace
    Test,
    /// Run the usbrescue CLI with the given arguments
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Write the udev rules of the CLI to a file
    Udev {
        #[arg(default_value = "50-usbrescue.rules")]
        output: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { release } => {
            println!("Building workspace...");
            let mut args = vec!["build", "--workspace"];
            if *release {
                args.push("--release");
            }
            cargo(&args, "Build")?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "usbrescue-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
        Commands::Udev { output } => {
            let out = Command::new("cargo")
                .args(["run", "-q", "-p", "usbrescue-cli", "--", "udev"])
                .output()?;
            if !out.status.success() {
                anyhow::bail!("udev rule generation failed");
            }
            std::fs::write(output, &out.stdout)?;
            println!("Wrote {}", output);
        }
    }

    Ok(())
}
