mod udev;

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use usbrescue_core::factory::{BatchConfig, FactorySession};
use usbrescue_core::flash::{self, DfuArtifact, FastbootUboot};
use usbrescue_core::protocol::{Fastboot, FastbootCommand};
use usbrescue_core::usb::DeviceProvider;
use usbrescue_core::{
    FirmwareSet, NusbProvider, RecoveryConfig, RecoverySession, SessionConfig, SocModel, TracingSink,
    UsbAddress, parse_size,
};

const FACTORY_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Recover and flash embedded boards over USB", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append logs to this file
    #[arg(long, global = true)]
    logfile: Option<PathBuf>,

    /// Retry and timeout tuning (TOML)
    #[arg(long, global = true)]
    session: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring a board in USB boot mode up to U-Boot
    Recover(RecoverArgs),
    /// Write storage through a running U-Boot gadget
    #[command(subcommand)]
    Flash(FlashCommand),
    /// Recover and flash every board of a batch
    Factory(FactoryArgs),
    /// Print the supported SoC models
    ListSocs,
    /// Print udev rules granting access to the supported devices
    Udev,
}

#[derive(Args, Debug)]
struct RecoverArgs {
    /// SoC model, see list-socs
    #[arg(short, long)]
    soc: SocModel,

    /// Firmware description file (YAML, or TOML by extension)
    #[arg(short = 'f', long = "firmware-file")]
    firmware_files: Vec<PathBuf>,

    /// Inline firmware description (YAML), e.g. "fip: {path: fip.bin}"
    #[arg(short = 'F', long = "firmware")]
    firmware: Vec<String>,

    /// ROM device: vid:pid or bus-port1.port2...
    #[arg(long = "usb-path")]
    usb: Option<UsbAddress>,
}

#[derive(Subcommand, Debug)]
enum FlashCommand {
    /// Download files to DFU alternate settings
    Dfu {
        /// Gadget device: vid:pid or bus-port1.port2...
        #[arg(short, long)]
        port: UsbAddress,
        /// altsetting:path
        #[arg(short = 'D', long = "dfu-config", required = true)]
        configs: Vec<DfuArtifact>,
        /// Bytes of each file to send
        #[arg(long)]
        size: Option<String>,
        /// USB timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run fastboot commands (verb[:arg])
    Fastboot {
        #[arg(short, long)]
        port: UsbAddress,
        #[arg(short = 'f', long = "fastboot-cmd", required = true)]
        commands: Vec<FastbootCommand>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// U-Boot flashing commands over fastboot, from a script or interactive
    FastbootUboot {
        #[arg(short, long)]
        port: UsbAddress,
        /// Command script, one command per line; interactive without it
        #[arg(short, long)]
        script: Option<PathBuf>,
        /// Preset environment variable, var=value
        #[arg(long = "set", value_parser = parse_assignment)]
        vars: Vec<(String, String)>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Copy to a board exposed as USB mass storage
    Ums {
        /// Source file
        #[arg(short, long)]
        src: PathBuf,
        /// Destination path on a mounted filesystem
        #[arg(short, long, conflicts_with = "blockdev", required_unless_present = "blockdev")]
        dest: Option<PathBuf>,
        /// Destination block device, written raw
        #[arg(short, long)]
        blockdev: Option<PathBuf>,
        /// Bytes to write to the block device
        #[arg(long, requires = "blockdev")]
        size: Option<String>,
    },
}

#[derive(Args, Debug)]
struct FactoryArgs {
    /// Batch description (YAML)
    batch: PathBuf,

    /// Directory session logs are written to [default: ~/.usbrescue/factory/logs]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Check the batch and its files, then stop
    #[arg(long)]
    check: bool,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((var, value)) if !var.is_empty() => Ok((var.to_string(), value.to_string())),
        _ => Err(format!("invalid assignment '{}', expected var=value", s)),
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(if cli.verbose {
            tracing::Level::DEBUG.into()
        } else {
            tracing::Level::INFO.into()
        })
        .from_env_lossy();

    let file_layer = match &cli.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .context("setting default subscriber failed")?;
    Ok(())
}

fn load_tuning(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load_from_file(path),
        None => Ok(SessionConfig::default()),
    }
}

fn with_timeout(mut tuning: SessionConfig, timeout: Option<u64>) -> SessionConfig {
    if let Some(ms) = timeout {
        tuning.transfer_timeout_ms = ms;
        tuning.fastboot_timeout_ms = ms;
    }
    tuning
}

fn parse_opt_size(size: Option<&str>) -> Result<Option<u64>> {
    size.map(|s| parse_size(s).with_context(|| format!("invalid size '{}'", s)))
        .transpose()
}

fn recover(args: RecoverArgs, tuning: SessionConfig) -> Result<()> {
    if args.firmware_files.is_empty() && args.firmware.is_empty() {
        bail!("missing firmware: give --firmware-file or --firmware");
    }
    let mut firmware = FirmwareSet::default();
    for path in &args.firmware_files {
        firmware.merge(FirmwareSet::load(path)?);
    }
    for (i, inline) in args.firmware.iter().enumerate() {
        firmware.merge(FirmwareSet::from_yaml_str(inline, &format!("--firmware #{}", i + 1))?);
    }
    let config = RecoveryConfig::new(args.soc, args.usb, firmware)?;

    let soc = config.soc;
    info!("Starting recovery of {} board", soc);
    let mut provider = NusbProvider::new(tuning.resolve_policy());
    RecoverySession::new(config, tuning).run(&mut provider)?;
    info!("Done recovering {} board", soc);
    Ok(())
}

fn flash(command: FlashCommand, tuning: SessionConfig) -> Result<()> {
    let sink = TracingSink;
    match command {
        FlashCommand::Dfu {
            port,
            configs,
            size,
            timeout,
        } => {
            let tuning = with_timeout(tuning, timeout);
            let size = parse_opt_size(size.as_deref())?
                .map(usize::try_from)
                .transpose()
                .context("size does not fit in memory")?;
            let device = NusbProvider::new(tuning.resolve_policy()).acquire(&port)?;
            flash::dfu::download(device.as_ref(), &sink, &configs, size)
        }
        FlashCommand::Fastboot {
            port,
            commands,
            timeout,
        } => {
            let tuning = with_timeout(tuning, timeout);
            let device = NusbProvider::new(tuning.resolve_policy()).acquire(&port)?;
            let fast = Fastboot::new(device.as_ref(), &sink, tuning.fastboot_timeout())?;
            flash::fastboot::run_commands(&fast, &commands)
        }
        FlashCommand::FastbootUboot {
            port,
            script,
            vars,
            timeout,
        } => {
            let tuning = with_timeout(tuning, timeout);
            let device = NusbProvider::new(tuning.resolve_policy()).acquire(&port)?;
            let fast = Fastboot::new(device.as_ref(), &sink, tuning.fastboot_timeout())?;
            let mut uboot = FastbootUboot::new(fast);
            for (var, value) in &vars {
                uboot.set_var(var, value);
            }
            match script {
                Some(path) => {
                    let content = fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let lines: Vec<&str> = content.lines().collect();
                    uboot.run_script(&lines)
                }
                None => uboot.interactive(&mut io::stdin().lock(), &mut io::stdout()),
            }
        }
        FlashCommand::Ums {
            src,
            dest,
            blockdev,
            size,
        } => {
            let sleep = |d: Duration| thread::sleep(d);
            if let Some(dev) = blockdev {
                let size = parse_opt_size(size.as_deref())?;
                let written = flash::ums::write_raw(&src, &dev, size, &sleep)?;
                info!(bytes = written, dev = %dev.display(), "Raw write complete");
            } else if let Some(dest) = dest {
                let written = flash::ums::copy_to_path(&src, &dest, &sleep)?;
                info!(path = %written.display(), "Copy complete");
            }
            Ok(())
        }
    }
}

fn default_log_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set, pass --log-dir")?;
    Ok(PathBuf::from(home).join(".usbrescue").join("factory").join("logs"))
}

/// Ask the operator to confirm one paused board. Returns false at end of
/// input.
fn prompt_operator(session: &mut FactorySession, input: &mut dyn BufRead) -> Result<bool> {
    let Some((board, prompt)) = session.paused().first().map(|(i, p)| (*i, p.to_string())) else {
        return Ok(true);
    };
    let path = session.boards()[board].path.to_string();
    let mut out = io::stdout();
    writeln!(out, "\n[board {}] {}", path, prompt)?;
    write!(out, "Press enter to resume board {}...", path)?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(false);
    }
    session.resume(board)?;
    Ok(true)
}

fn factory(args: FactoryArgs, tuning: SessionConfig) -> Result<()> {
    let batch = BatchConfig::load(&args.batch)?;
    info!(batch = %args.batch.display(), boards = batch.boards.len(), "Batch loaded");
    if args.check {
        for (ids, model) in &batch.boards {
            println!("{}: {}", ids, model);
        }
        return Ok(());
    }
    let log_dir = match args.log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    let policy = tuning.resolve_policy();
    let entries = NusbProvider::new(policy).list()?;
    let mut session = FactorySession::new(batch, tuning, &entries);
    session.start(|| Box::new(NusbProvider::new(policy)) as Box<dyn DeviceProvider>)?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut operator = true;
    while !session.poll() {
        if operator && !session.paused().is_empty() {
            operator = prompt_operator(&mut session, &mut input)?;
            if !operator {
                warn!("Operator input closed, paused boards will not be resumed");
                break;
            }
            continue;
        }
        thread::sleep(FACTORY_POLL);
    }

    let summary = session.summary();
    let path = session.save_log(&log_dir)?;
    info!(
        done = summary.done,
        failed = summary.failed,
        log = %path.display(),
        "Factory session finished"
    );
    drop(session);
    if summary.failed > 0 || summary.done == 0 {
        bail!(
            "{} boards done, {} failed, see {}",
            summary.done,
            summary.failed,
            path.display()
        );
    }
    Ok(())
}

fn list_socs() {
    let mut socs: Vec<SocModel> = SocModel::all().collect();
    socs.sort_by_key(|soc| (soc.family().to_string(), soc.name()));
    for soc in socs {
        match soc.default_usb() {
            Some(usb) => println!("{:<12} {:<10} {}", soc.name(), soc.family(), usb),
            None => println!("{:<12} {}", soc.name(), soc.family()),
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let tuning = load_tuning(cli.session.as_deref())?;
    match cli.command {
        Command::Recover(args) => recover(args, tuning),
        Command::Flash(command) => flash(command, tuning),
        Command::Factory(args) => factory(args, tuning),
        Command::ListSocs => {
            list_socs();
            Ok(())
        }
        Command::Udev => {
            print!("{}", udev::rules());
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        if let Some(path) = udev::permission_denied(&e) {
            eprintln!("\n{}", udev::guidance(path));
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recover_args() {
        let cli = Cli::try_parse_from([
            "usbrescue",
            "recover",
            "--soc",
            "stm32mp15",
            "-f",
            "fw.yaml",
            "-F",
            "fip: {path: fip.bin}",
            "--usb-path",
            "1-3.2",
        ])
        .unwrap();
        let Command::Recover(args) = cli.command else {
            panic!("expected recover");
        };
        assert_eq!(args.soc.name(), "stm32mp15");
        assert_eq!(args.firmware_files, vec![PathBuf::from("fw.yaml")]);
        assert_eq!(args.firmware.len(), 1);
        assert_eq!(args.usb.unwrap().to_string(), "1-3.2");
    }

    #[test]
    fn test_unknown_soc_rejected() {
        assert!(Cli::try_parse_from(["usbrescue", "recover", "--soc", "pdp11"]).is_err());
    }

    #[test]
    fn test_flash_fastboot_commands_parsed() {
        let cli = Cli::try_parse_from([
            "usbrescue",
            "flash",
            "fastboot",
            "-p",
            "0483:0afb",
            "-f",
            "download:boot.img",
            "-f",
            "flash:mmc0",
            "-f",
            "reboot",
        ])
        .unwrap();
        let Command::Flash(FlashCommand::Fastboot { commands, port, .. }) = cli.command else {
            panic!("expected flash fastboot");
        };
        assert_eq!(port, UsbAddress::Ids { vid: 0x0483, pid: 0x0afb });
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1], FastbootCommand::Flash("mmc0".to_string()));
    }

    #[test]
    fn test_ums_needs_one_destination() {
        assert!(Cli::try_parse_from(["usbrescue", "flash", "ums", "-s", "u-boot.stm32"]).is_err());
        assert!(
            Cli::try_parse_from([
                "usbrescue", "flash", "ums", "-s", "a", "-d", "/mnt/a", "-b", "/dev/sdb"
            ])
            .is_err()
        );
        assert!(Cli::try_parse_from(["usbrescue", "flash", "ums", "-s", "a", "-b", "/dev/sdb"]).is_ok());
    }

    #[test]
    fn test_uboot_assignments() {
        assert_eq!(
            parse_assignment("fb-addr=0xc0000000").unwrap(),
            ("fb-addr".to_string(), "0xc0000000".to_string())
        );
        assert!(parse_assignment("=1").is_err());
        assert!(parse_assignment("target").is_err());
    }

    #[test]
    fn test_timeout_overrides_both_timeouts() {
        let tuning = with_timeout(SessionConfig::default(), Some(60000));
        assert_eq!(tuning.transfer_timeout(), Duration::from_secs(60));
        assert_eq!(tuning.fastboot_timeout(), Duration::from_secs(60));
        assert_eq!(with_timeout(SessionConfig::default(), None), SessionConfig::default());
    }
}
