//! Tegra firmware bundling and flashing.
//!
//! A [`Bundler`] turns U-Boot, a BCT and a device tree into a signed boot
//! image; a [`FirmwareWriter`] puts that image on the board.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tempfile::TempDir;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::layout::Layout;
use crate::modules::util;

pub mod bundle;
pub mod fdt;
pub mod write;

pub use bundle::{Bundle, BundleRequest, Bundler, TegraBundle};
pub use fdt::FdtChanges;
pub use write::{FirmwareWriter, ServoWriter, UsbWriter, WriteRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashDest {
    Spi,
    Mmc,
    Nand,
}

impl FromStr for FlashDest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "spi" => Ok(Self::Spi),
            "mmc" => Ok(Self::Mmc),
            "nand" => Ok(Self::Nand),
            other => Err(Error::input(format!(
                "invalid flash destination '{other}' (expected spi, mmc or nand)"
            ))),
        }
    }
}

impl fmt::Display for FlashDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spi => "spi",
            Self::Mmc => "mmc",
            Self::Nand => "nand",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Usb,
    Servo,
}

impl FromStr for WriteMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "usb" => Ok(Self::Usb),
            "servo" => Ok(Self::Servo),
            other => Err(Error::input(format!(
                "invalid write method '{other}' (expected usb or servo)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoPort {
    Any,
    None,
    Port(u16),
}

impl FromStr for ServoPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "any" => Ok(Self::Any),
            "none" => Ok(Self::None),
            other => other.parse().map(Self::Port).map_err(|_| {
                Error::input(format!(
                    "invalid servo '{other}' (expected any, none or a port number)"
                ))
            }),
        }
    }
}

/// Parse `KEY=VALUE` from `--add-config-*`.
pub fn parse_config_pair(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(Error::input(format!(
            "invalid config option '{raw}' (expected KEY=VALUE)"
        ))),
    }
}

fn default_servo_on() -> Vec<String> {
    [
        "cold_reset:on",
        "spi2_vref:pp3300",
        "spi2_buf_en:on",
        "spi2_buf_on_flex_en:on",
        "spi_hold:off",
    ]
    .map(String::from)
    .to_vec()
}

fn default_servo_off() -> Vec<String> {
    [
        "spi2_vref:off",
        "spi2_buf_en:off",
        "spi2_buf_on_flex_en:off",
        "cold_reset:off",
    ]
    .map(String::from)
    .to_vec()
}

/// `[firmware]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Defaults to `<build_root>/<board>/firmware`.
    pub firmware_dir: Option<String>,
    pub flash: FlashDest,
    pub servo: String,
    pub servo_on: Vec<String>,
    pub servo_off: Vec<String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            firmware_dir: None,
            flash: FlashDest::Spi,
            servo: "any".into(),
            servo_on: default_servo_on(),
            servo_off: default_servo_off(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteFirmwareOptions {
    pub board: String,
    pub firmware_dir: PathBuf,
    pub uboot: Option<PathBuf>,
    pub uboot_flasher: Option<PathBuf>,
    pub bct: Option<PathBuf>,
    /// Path, or a bare name looked up as `dts/<name>.dts`.
    pub fdt: Option<String>,
    pub postload: Option<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub preserve: bool,
    pub flash: FlashDest,
    pub write: Option<WriteMethod>,
    pub servo: ServoPort,
    pub verify: bool,
    pub output: Option<PathBuf>,
    pub changes: FdtChanges,
    pub servo_on: Vec<String>,
    pub servo_off: Vec<String>,
}

impl WriteFirmwareOptions {
    pub fn from_doc(doc: &ConfigDoc, layout: &Layout, board: String) -> Result<Self> {
        let cfg: FirmwareConfig = doc.section("firmware")?;
        let firmware_dir = match cfg.firmware_dir.as_deref() {
            Some(dir) => layout.resolve(dir)?,
            None => layout.board_root(&board).join("firmware"),
        };
        Ok(Self {
            board,
            firmware_dir,
            uboot: None,
            uboot_flasher: None,
            bct: None,
            fdt: None,
            postload: None,
            outdir: None,
            preserve: false,
            flash: cfg.flash,
            write: None,
            servo: cfg.servo.parse()?,
            verify: false,
            output: None,
            changes: FdtChanges::default(),
            servo_on: cfg.servo_on,
            servo_off: cfg.servo_off,
        })
    }

    fn needs_fdtput(&self) -> bool {
        !self.changes.is_empty() || self.postload.is_some() || self.write == Some(WriteMethod::Usb)
    }

    pub fn required_tools(&self) -> Vec<&'static str> {
        let mut tools = vec!["dtc", "fdtget"];
        if self.needs_fdtput() {
            tools.push("fdtput");
        }
        tools
    }
}

pub fn check_required_tools(ctx: &ExecCtx, tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|t| ctx.tools().find(t).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::input(format!(
        "required tool(s) not found: {} (install the device-tree compiler or set [tools])",
        missing.join(", ")
    )))
}

/// `tegra2_seaboard` -> `dts/*tegra2-seaboard*.dts`, when exactly one matches.
pub fn default_fdt(firmware_dir: &Path, board: &str) -> PathBuf {
    let dts_dir = firmware_dir.join("dts");
    let needle = board.replace('_', "-");
    let matches: Vec<PathBuf> = fs::read_dir(&dts_dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension().is_some_and(|e| e == "dts")
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.contains(&needle))
                })
                .collect()
        })
        .unwrap_or_default();
    match matches.as_slice() {
        [only] => only.clone(),
        _ => dts_dir.join(format!("{board}.dts")),
    }
}

pub fn resolve_fdt(firmware_dir: &Path, board: &str, fdt: Option<&str>) -> PathBuf {
    match fdt.map(str::trim).filter(|f| !f.is_empty()) {
        None => default_fdt(firmware_dir, board),
        Some(f) if f.contains('/') || f.ends_with(".dts") || f.ends_with(".dtb") => {
            PathBuf::from(f)
        }
        Some(name) => firmware_dir.join("dts").join(format!("{name}.dts")),
    }
}

fn require_file(what: &str, p: PathBuf) -> Result<PathBuf> {
    if p.is_file() {
        Ok(p)
    } else {
        Err(Error::input(format!("{what} file {} not found", p.display())))
    }
}

enum OutDir {
    Given(PathBuf),
    Temp(TempDir),
}

impl OutDir {
    fn path(&self) -> &Path {
        match self {
            Self::Given(p) => p,
            Self::Temp(t) => t.path(),
        }
    }
}

pub fn run(opts: WriteFirmwareOptions, ctx: &mut ExecCtx) -> Result<Bundle> {
    if opts.board.trim().is_empty() {
        return Err(Error::input("--board is required"));
    }
    check_required_tools(ctx, &opts.required_tools())?;

    let fw = opts.firmware_dir.as_path();
    let uboot = require_file(
        "U-Boot",
        opts.uboot.clone().unwrap_or_else(|| fw.join("u-boot.bin")),
    )?;
    let bct = require_file(
        "BCT",
        opts.bct.clone().unwrap_or_else(|| fw.join("bct").join("board.bct")),
    )?;
    let fdt = require_file("FDT", resolve_fdt(fw, &opts.board, opts.fdt.as_deref()))?;
    let postload = opts
        .postload
        .clone()
        .map(|p| require_file("postload", p))
        .transpose()?;
    let uboot_flasher = opts
        .uboot_flasher
        .clone()
        .map(|p| require_file("flasher U-Boot", p))
        .transpose()?;

    let outdir = match &opts.outdir {
        Some(dir) => {
            util::ensure_dir(dir)?;
            OutDir::Given(dir.clone())
        }
        None => OutDir::Temp(
            tempfile::Builder::new()
                .prefix("write-firmware.")
                .tempdir()
                .map_err(|e| Error::io(format!("failed to create outdir: {e}")).with_source(e))?,
        ),
    };
    tracing::info!("output directory: {}", outdir.path().display());

    let req = BundleRequest {
        board: opts.board.clone(),
        uboot: uboot.clone(),
        bct: bct.clone(),
        fdt,
        postload,
        changes: opts.changes.clone(),
        outdir: outdir.path().to_path_buf(),
    };
    let result = TegraBundle.bundle(ctx, &req).and_then(|bundle| {
        if let Some(output) = &opts.output {
            ctx.step("firmware.output", |ctx| {
                ctx.log(&format!("copying image to {}", output.display()));
                fs::copy(&bundle.image, output).map_err(|e| {
                    Error::io(format!("failed to copy image to {}: {e}", output.display()))
                        .with_source(e)
                })?;
                Ok(())
            })?;
        }
        if let Some(method) = opts.write {
            let wreq = WriteRequest {
                bct,
                flash: opts.flash,
                verify: opts.verify,
                outdir: req.outdir.clone(),
                uboot_flasher,
                uboot,
                servo: opts.servo,
                servo_on: opts.servo_on.clone(),
                servo_off: opts.servo_off.clone(),
            };
            let writer: Box<dyn FirmwareWriter> = match method {
                WriteMethod::Usb => Box::new(UsbWriter),
                WriteMethod::Servo => Box::new(ServoWriter),
            };
            writer.write(ctx, &bundle, &wreq)?;
        }
        Ok(bundle)
    });

    match outdir {
        OutDir::Temp(dir) if opts.preserve => {
            let kept = dir.keep();
            tracing::info!("preserved output directory {}", kept.display());
        }
        OutDir::Temp(dir) => {
            if let Err(e) = dir.close() {
                tracing::warn!("failed to remove output directory: {e}");
            }
        }
        OutDir::Given(_) => {}
    }
    result
}
