use std::path::{Path, PathBuf};

use super::bundle::Bundle;
use super::fdt::{Fdt, decode_text_base};
use super::{FlashDest, ServoPort};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;

const PAGE: u64 = 0x1000;
const MMC_BLOCK: u64 = 512;

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub bct: PathBuf,
    pub flash: FlashDest,
    pub verify: bool,
    pub outdir: PathBuf,
    /// U-Boot used to run the flash script; the bundled one when unset.
    pub uboot_flasher: Option<PathBuf>,
    pub uboot: PathBuf,
    pub servo: ServoPort,
    pub servo_on: Vec<String>,
    pub servo_off: Vec<String>,
}

pub trait FirmwareWriter {
    fn write(&self, ctx: &mut ExecCtx, bundle: &Bundle, req: &WriteRequest) -> Result<()>;
}

fn align_up(n: u64, to: u64) -> u64 {
    n.div_ceil(to) * to
}

/// U-Boot commands that copy `size` bytes at `addr` into the flash device.
/// Numbers are fixed width so the script length does not depend on them.
pub fn flash_script(dest: FlashDest, addr: u64, size: u64, verify: bool) -> String {
    let readback = addr + align_up(size, PAGE);
    let erase = align_up(size, PAGE);
    let blocks = size.div_ceil(MMC_BLOCK);
    let mut cmds = match dest {
        FlashDest::Spi => vec![
            "sf probe 0".to_string(),
            format!("sf erase 0 {erase:#010x}"),
            format!("sf write {addr:#010x} 0 {size:#010x}"),
        ],
        FlashDest::Nand => vec![
            format!("nand erase 0 {erase:#010x}"),
            format!("nand write {addr:#010x} 0 {erase:#010x}"),
        ],
        FlashDest::Mmc => vec![
            "mmc dev 0 1".to_string(),
            format!("mmc write {addr:#010x} 0 {blocks:#010x}"),
        ],
    };
    if verify {
        cmds.push(match dest {
            FlashDest::Spi => format!("sf read {readback:#010x} 0 {size:#010x}"),
            FlashDest::Nand => format!("nand read {readback:#010x} 0 {erase:#010x}"),
            FlashDest::Mmc => format!("mmc read {readback:#010x} 0 {blocks:#010x}"),
        });
        cmds.push(format!("cmp.b {addr:#010x} {readback:#010x} {size:#010x}"));
    }
    cmds.push("echo Flash completed".to_string());
    cmds.join("; ")
}

/// Loads a flasher U-Boot over USB recovery with `nvflash`; its boot command
/// writes the payload appended after it.
#[derive(Debug, Default)]
pub struct UsbWriter;

impl UsbWriter {
    fn build_flasher(&self, ctx: &ExecCtx, bundle: &Bundle, req: &WriteRequest) -> Result<PathBuf> {
        let flasher_uboot = req.uboot_flasher.as_deref().unwrap_or(&req.uboot);
        let uboot_data = util::read_bytes(flasher_uboot)?;
        let payload = util::read_bytes(&bundle.image)?;
        let text_base = u64::from(decode_text_base(&uboot_data).unwrap_or(bundle.text_base));

        let fdt = Fdt::new(ctx, bundle.fdt.clone()).copy_to(req.outdir.join("flasher.dtb"))?;
        let size = payload.len() as u64;
        fdt.put_int("/config", "bootsecure", 0)?;
        // First pass only sizes the tree; the script length is address-independent.
        fdt.put_string("/config", "bootcmd", &flash_script(req.flash, 0, size, req.verify))?;
        let fdt_len = util::read_bytes(fdt.path())?.len() as u64;
        let payload_offset = align_up(uboot_data.len() as u64 + fdt_len, PAGE);
        let script = flash_script(req.flash, text_base + payload_offset, size, req.verify);
        fdt.put_string("/config", "bootcmd", &script)?;
        tracing::info!("flash script: {script}");

        let fdt_data = util::read_bytes(fdt.path())?;
        if fdt_data.len() as u64 != fdt_len {
            return Err(Error::command("flasher fdt changed size while setting bootcmd"));
        }
        let mut image = Vec::with_capacity((payload_offset + size) as usize);
        image.extend_from_slice(&uboot_data);
        image.extend_from_slice(&fdt_data);
        image.resize(payload_offset as usize, 0);
        image.extend_from_slice(&payload);

        let flasher = req.outdir.join("flasher.bin");
        util::write_bytes(&flasher, &image)?;
        Ok(flasher)
    }
}

impl FirmwareWriter for UsbWriter {
    fn write(&self, ctx: &mut ExecCtx, bundle: &Bundle, req: &WriteRequest) -> Result<()> {
        let flasher = ctx.step("firmware.flasher", |ctx| self.build_flasher(ctx, bundle, req))?;
        ctx.step("firmware.nvflash", |ctx| {
            let mut cmd = ctx.command("nvflash");
            cmd.arg("--bct")
                .arg(&req.bct)
                .arg("--setbct")
                .arg("--bl")
                .arg(&flasher)
                .arg("--go");
            ctx.run_cmd(cmd)
        })
    }
}

/// `dut-control` settings held for the duration of a servo write.
pub struct DutControlGuard {
    ctx: ExecCtx,
    port: Option<u16>,
    restore: Vec<String>,
}

impl DutControlGuard {
    pub fn apply(ctx: &ExecCtx, port: Option<u16>, on: &[String], off: &[String]) -> Result<Self> {
        let guard = Self {
            ctx: ctx.clone(),
            port,
            restore: off.to_vec(),
        };
        if !on.is_empty() {
            // A partial apply still gets restored when `guard` drops.
            ctx.run_cmd(guard.command(on))?;
        }
        Ok(guard)
    }

    fn command(&self, settings: &[String]) -> std::process::Command {
        let mut cmd = self.ctx.command("dut-control");
        if let Some(port) = self.port {
            cmd.arg("--port").arg(port.to_string());
        }
        cmd.args(settings);
        cmd
    }
}

impl Drop for DutControlGuard {
    fn drop(&mut self) {
        if self.restore.is_empty() {
            return;
        }
        let cmd = self.command(&self.restore);
        self.ctx.run_cleanup_cmd(cmd);
    }
}

/// SPI flash written through a servo board with `flashrom`.
#[derive(Debug, Default)]
pub struct ServoWriter;

pub fn flashrom_programmer(port: Option<u16>) -> String {
    match port {
        Some(p) => format!("ft2232_spi:type=servo-v2,port={p}"),
        None => "ft2232_spi:type=servo-v2".to_string(),
    }
}

fn flashrom(ctx: &ExecCtx, port: Option<u16>, op: &str, image: &Path) -> Result<()> {
    let mut cmd = ctx.command("flashrom");
    cmd.arg("-p").arg(flashrom_programmer(port)).arg(op).arg(image);
    ctx.run_cmd(cmd)
}

impl FirmwareWriter for ServoWriter {
    fn write(&self, ctx: &mut ExecCtx, bundle: &Bundle, req: &WriteRequest) -> Result<()> {
        let port = match req.servo {
            ServoPort::None => {
                return Err(Error::input("servo write requested but --servo is 'none'"));
            }
            ServoPort::Any => None,
            ServoPort::Port(p) => Some(p),
        };
        if req.flash != FlashDest::Spi {
            return Err(Error::input(format!(
                "servo can only write spi flash, not {}",
                req.flash
            )));
        }
        ctx.step("firmware.servo", |ctx| {
            let _dut = DutControlGuard::apply(ctx, port, &req.servo_on, &req.servo_off)?;
            flashrom(ctx, port, "-w", &bundle.image)?;
            if req.verify {
                flashrom(ctx, port, "-v", &bundle.image)?;
            }
            Ok(())
        })
    }
}
