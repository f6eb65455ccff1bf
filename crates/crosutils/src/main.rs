use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crosutils::config::{self, ConfigDoc};
use crosutils::executor::{ExecCtx, ToolPaths, TracingSink, signals};
use crosutils::layout::Layout;
use crosutils::modules::firmware::{
    self, FlashDest, ServoPort, WriteFirmwareOptions, WriteMethod, parse_config_pair,
};
use crosutils::modules::profile::{self, ChooseProfileOptions};
use crosutils::modules::remote_merge::{self, RemoteMergeOptions};
use crosutils::modules::stateful::{self, StatefulChange, StatefulUpdateOptions};
use crosutils::{Error, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Chromium OS build and device provisioning helpers")]
struct Cli {
    /// TOML config file (default: $CROSUTILS_CONFIG, else built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 0 = errors only, 1-2 = progress, 3 = debug, 4 = trace and full error detail
    #[arg(short, long, global = true, default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=4))]
    verbosity: u8,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Log commands that would change the host or device instead of running them
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a stateful partition payload and mark it for the next boot
    StatefulUpdate(StatefulUpdateArgs),
    /// Point a board's make.profile at the right Portage profile
    ChooseProfile(ChooseProfileArgs),
    /// Merge board packages onto a device over SSHFS
    RemoteMerge(RemoteMergeArgs),
    /// Bundle Tegra firmware and optionally flash it
    WriteFirmware(WriteFirmwareArgs),
    /// Print the fully-resolved config (after imports/extends)
    ShowConfig,
}

#[derive(Debug, Args)]
struct StatefulUpdateArgs {
    /// Payload URL; derived from the devserver in lsb-release when omitted
    url: Option<String>,
    /// old, clean or reset
    #[arg(long, default_value = "old")]
    stateful_change: StatefulChange,
    #[arg(long)]
    stateful_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ChooseProfileArgs {
    #[arg(long)]
    board: Option<String>,
    #[arg(long)]
    variant: Option<String>,
    /// Profile name inside the overlays, or a path to a profile directory
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    board_overlay: Option<PathBuf>,
    #[arg(long)]
    build_root: Option<PathBuf>,
    /// Overlay directory, least specific first (repeatable)
    #[arg(long = "overlay")]
    overlays: Vec<PathBuf>,
    #[arg(long)]
    toolchain_conf: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RemoteMergeArgs {
    #[arg(long)]
    board: String,
    /// Device hostname or IP
    #[arg(long)]
    remote: String,
    #[arg(required = true)]
    packages: Vec<String>,
    #[arg(long)]
    unmerge: bool,
    /// Parallel emerge jobs (default: CPU count)
    #[arg(long)]
    jobs: Option<usize>,
    /// Update build dependencies locally first
    #[arg(long)]
    update_deps: bool,
    /// Install into the root filesystem instead of the stateful dev image
    #[arg(long)]
    root_install: bool,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
struct WriteFirmwareArgs {
    #[arg(short, long)]
    board: Option<String>,
    #[arg(short = 'c', long)]
    bct: Option<PathBuf>,
    /// Device tree source/blob, or a name looked up under dts/
    #[arg(short = 'd', long = "dt")]
    dt: Option<String>,
    #[arg(short = 'u', long)]
    uboot: Option<PathBuf>,
    /// U-Boot used to run the flash script over USB
    #[arg(short = 'U', long)]
    uboot_flasher: Option<PathBuf>,
    #[arg(short = 'P', long)]
    postload: Option<PathBuf>,
    #[arg(short = 'O', long)]
    outdir: Option<PathBuf>,
    /// Keep the temporary output directory
    #[arg(short = 'p', long)]
    preserve: bool,
    /// spi, mmc or nand
    #[arg(short = 'F', long)]
    flash: Option<FlashDest>,
    /// usb or servo
    #[arg(short = 'w', long)]
    write: Option<WriteMethod>,
    /// any, none or a port number
    #[arg(long)]
    servo: Option<ServoPort>,
    #[arg(short = 'V', long)]
    verify: bool,
    /// Copy the final image here
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// U-Boot boot command ('none' clears it)
    #[arg(long)]
    bootcmd: Option<String>,
    #[arg(long)]
    bootsecure: bool,
    #[arg(long = "add-config-str", value_name = "KEY=VAL")]
    config_str: Vec<String>,
    #[arg(long = "add-config-int", value_name = "KEY=VAL")]
    config_int: Vec<String>,
    /// Node path or alias to enable (repeatable)
    #[arg(long)]
    enable: Vec<String>,
    /// Node path or alias to disable (repeatable)
    #[arg(long)]
    disable: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };
    init_tracing(cli.verbosity, cli.log_format);
    signals::install();

    let verbosity = cli.verbosity;
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{}", e.detail());
            if verbosity >= 4 {
                eprintln!("error: {}", e.detail());
            } else {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => "error",
        1 | 2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("crosutils={level}")));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let doc = config::load_or_default(cli.config.as_deref())?;
    if let Command::ShowConfig = cli.cmd {
        return cmd_show_config(&doc);
    }

    let tools = ToolPaths::from_doc(&doc)?;
    let mut ctx = ExecCtx::new(cli.dry_run, Arc::new(TracingSink)).with_tools(tools);
    let layout = Layout::from_doc(&doc)?;

    match cli.cmd {
        Command::StatefulUpdate(args) => {
            let mut opts = StatefulUpdateOptions::from_doc(
                &doc,
                &layout,
                args.stateful_change,
                args.url,
            )?;
            if let Some(dir) = args.stateful_dir {
                opts.stateful_dir = dir;
            }
            stateful::run(opts, &mut ctx)
        }
        Command::ChooseProfile(args) => cmd_choose_profile(&doc, layout, args, &mut ctx),
        Command::RemoteMerge(args) => {
            let mut opts = RemoteMergeOptions::from_doc(&doc, &layout)?;
            opts.board = args.board;
            opts.remote = args.remote;
            opts.packages = args.packages;
            opts.unmerge = args.unmerge;
            opts.update_deps = args.update_deps;
            opts.root_install = args.root_install;
            if let Some(jobs) = args.jobs {
                opts.jobs = jobs;
            }
            if let Some(user) = args.user {
                opts.user = user;
            }
            remote_merge::run(opts, &mut ctx)
        }
        Command::WriteFirmware(args) => cmd_write_firmware(&doc, &layout, args, &mut ctx),
        Command::ShowConfig => Ok(()),
    }
}

fn cmd_show_config(doc: &ConfigDoc) -> Result<()> {
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::input(format!("cannot render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn board_or_default(board: Option<String>, layout: &Layout) -> Result<String> {
    board
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .or_else(|| layout.default_board())
        .ok_or_else(|| Error::input("--board is required (no default board is set)"))
}

fn cmd_choose_profile(
    doc: &ConfigDoc,
    mut layout: Layout,
    args: ChooseProfileArgs,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let board = board_or_default(args.board, &layout)?;
    if let Some(root) = args.build_root {
        layout.build_root = root;
    }
    let mut opts = ChooseProfileOptions::from_doc(doc, layout, board)?;
    opts.variant = args.variant;
    opts.profile = args.profile;
    opts.board_overlay = args.board_overlay;
    opts.toolchain_conf = args.toolchain_conf;
    if !args.overlays.is_empty() {
        opts.overlays = args.overlays;
    }
    let chosen = profile::run(opts, ctx)?;
    tracing::info!("selected profile {}", chosen.display());
    Ok(())
}

fn cmd_write_firmware(
    doc: &ConfigDoc,
    layout: &Layout,
    args: WriteFirmwareArgs,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let board = board_or_default(args.board, layout)?;
    let mut opts = WriteFirmwareOptions::from_doc(doc, layout, board)?;
    opts.uboot = args.uboot;
    opts.uboot_flasher = args.uboot_flasher;
    opts.bct = args.bct;
    opts.fdt = args.dt;
    opts.postload = args.postload;
    opts.outdir = args.outdir;
    opts.preserve = args.preserve;
    opts.write = args.write;
    opts.verify = args.verify;
    opts.output = args.output;
    if let Some(flash) = args.flash {
        opts.flash = flash;
    }
    if let Some(servo) = args.servo {
        opts.servo = servo;
    }

    opts.changes.bootcmd = args.bootcmd;
    opts.changes.bootsecure = args.bootsecure;
    opts.changes.config_str = args
        .config_str
        .iter()
        .map(|s| parse_config_pair(s))
        .collect::<Result<_>>()?;
    opts.changes.config_int = args
        .config_int
        .iter()
        .map(|s| parse_config_pair(s))
        .collect::<Result<_>>()?;
    opts.changes.enable = args
        .enable
        .into_iter()
        .map(|n| (n, true))
        .chain(args.disable.into_iter().map(|n| (n, false)))
        .collect();

    let bundle = firmware::run(opts, ctx)?;
    tracing::info!("firmware image {}", bundle.image.display());
    Ok(())
}
