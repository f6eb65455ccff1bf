use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::fdt::{Fdt, FdtChanges, decode_text_base};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;

/// Inputs for one firmware bundle.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub board: String,
    pub uboot: PathBuf,
    pub bct: PathBuf,
    /// `.dts` source or an already compiled `.dtb`.
    pub fdt: PathBuf,
    pub postload: Option<PathBuf>,
    pub changes: FdtChanges,
    pub outdir: PathBuf,
}

/// Files produced by a bundler, all inside the request's outdir.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub fdt: PathBuf,
    pub bootstub: PathBuf,
    pub signed: PathBuf,
    /// What gets written to the board.
    pub image: PathBuf,
    pub text_base: u32,
}

pub trait Bundler {
    fn bundle(&self, ctx: &mut ExecCtx, req: &BundleRequest) -> Result<Bundle>;
}

/// Signed boot images for Tegra SoCs: U-Boot + fdt, signed with the BCT.
#[derive(Debug, Default)]
pub struct TegraBundle;

impl TegraBundle {
    fn compile_fdt(&self, ctx: &ExecCtx, src: &Path, outdir: &Path) -> Result<PathBuf> {
        let stem = src
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::input(format!("invalid fdt path {}", src.display())))?;
        let out = outdir.join(format!("{stem}.dtb"));
        if src.extension().is_some_and(|e| e == "dtb") {
            util::write_bytes(&out, &util::read_bytes(src)?)?;
            return Ok(out);
        }
        let mut cmd = ctx.command("dtc");
        cmd.arg("-I")
            .arg("dts")
            .arg("-O")
            .arg("dtb")
            .arg("-o")
            .arg(&out)
            .arg(src);
        if let Some(dir) = src.parent() {
            cmd.arg("-i").arg(dir);
        }
        ctx.run_scratch_cmd(cmd)?;
        Ok(out)
    }

    /// TEXT_BASE from the fdt, overridden by the one in the U-Boot header.
    fn text_base(&self, fdt: &Fdt<'_>, uboot: &Path, uboot_data: &[u8]) -> Result<u32> {
        let fdt_text_base = (fdt.get_int("/chromeos-config", "textbase", 0)? & 0xffff_ffff) as u32;
        let decoded = decode_text_base(uboot_data);
        tracing::info!(
            "TEXT_BASE: fdt says {fdt_text_base:#x}, {} says {}",
            uboot.display(),
            decoded.map_or_else(|| "none".to_string(), |v| format!("{v:#x}"))
        );
        let text_base = match decoded {
            Some(v) if v != fdt_text_base => {
                tracing::warn!(
                    "TEXT_BASE {v:#x} in U-Boot doesn't match fdt value {fdt_text_base:#x}; using {v:#x}"
                );
                v
            }
            _ => fdt_text_base,
        };
        if text_base == 0 {
            return Err(Error::input(format!(
                "cannot determine TEXT_BASE from {} or {}",
                fdt.path().display(),
                uboot.display()
            )));
        }
        Ok(text_base)
    }
}

/// `cbootimage` config for signing `bootstub` at `text_base`.
pub fn boot_config(bct: &Path, bootstub: &Path, text_base: u32, single_bct: bool) -> String {
    let mut cfg = String::new();
    let _ = writeln!(cfg, "Version    = 1;");
    let _ = writeln!(cfg, "Redundancy = 1;");
    let _ = writeln!(cfg, "Bctfile    = {};", bct.display());
    if single_bct {
        // NAND flash maps only have room for one BCT copy.
        let _ = writeln!(cfg, "Bctcopy = 1;");
    }
    let _ = writeln!(
        cfg,
        "BootLoader = {},{text_base:#x},{text_base:#x},Complete;",
        bootstub.display()
    );
    cfg
}

fn sign_bootstub(
    ctx: &ExecCtx,
    outdir: &Path,
    bct: &Path,
    bootstub: &Path,
    text_base: u32,
) -> Result<PathBuf> {
    let mut dump = ctx.command("bct_dump");
    dump.arg(bct);
    let is_nand = ctx.query(dump)?.contains("NvBootDevType_Nand");

    let config = outdir.join("boot.cfg");
    util::write_bytes(
        &config,
        boot_config(bct, bootstub, text_base, is_nand).as_bytes(),
    )?;
    let signed = outdir.join("signed.bin");
    let mut cmd = ctx.command("cbootimage");
    cmd.arg(&config).arg(&signed);
    ctx.run_scratch_cmd(cmd)?;
    Ok(signed)
}

fn concat(dest: &Path, parts: &[&[u8]]) -> Result<()> {
    util::write_bytes(dest, &parts.concat())
}

impl Bundler for TegraBundle {
    fn bundle(&self, ctx: &mut ExecCtx, req: &BundleRequest) -> Result<Bundle> {
        util::ensure_dir(&req.outdir)?;
        let out = req.outdir.as_path();

        let fdt_path = ctx.step("firmware.fdt", |ctx| {
            let path = self.compile_fdt(ctx, &req.fdt, out)?;
            if !req.changes.is_empty() {
                Fdt::new(ctx, path.clone()).apply(&req.changes)?;
            }
            Ok(path)
        })?;

        ctx.step("firmware.bootstub", |ctx| {
            let fdt = Fdt::new(ctx, fdt_path.clone());
            let uboot_data = util::read_bytes(&req.uboot)?;
            let text_base = self.text_base(&fdt, &req.uboot, &uboot_data)?;
            let bootstub = out.join("u-boot-fdt.bin");
            let image = out.join("image.bin");

            let Some(postload) = req.postload.as_deref() else {
                concat(&bootstub, &[&uboot_data, &util::read_bytes(&fdt_path)?])?;
                let signed = sign_bootstub(ctx, out, &req.bct, &bootstub, text_base)?;
                util::write_bytes(&image, &util::read_bytes(&signed)?)?;
                return Ok(Bundle {
                    fdt: fdt_path.clone(),
                    bootstub,
                    signed,
                    image,
                    text_base,
                });
            };

            // The unsigned stub carries postload inline (offset -1); the signed
            // one records where postload starts after the signed image.
            let stub_fdt = fdt.copy_to(out.join("bootstub.dtb"))?;
            stub_fdt.put_int("/config", "postload-text-offset", 0xffff_ffff)?;
            concat(&bootstub, &[&uboot_data, &util::read_bytes(stub_fdt.path())?])?;
            let signed = sign_bootstub(ctx, out, &req.bct, &bootstub, text_base)?;
            let signed_len = util::read_bytes(&signed)?.len();

            let postload_data = util::read_bytes(postload)?;
            let stub_with_postload = out.join("u-boot-fdt-postload.bin");
            concat(
                &stub_with_postload,
                &[&util::read_bytes(&bootstub)?, &postload_data],
            )?;

            stub_fdt.put_int("/config", "postload-text-offset", signed_len as u64)?;
            let resigned_stub = out.join("postload.bin");
            concat(&resigned_stub, &[&uboot_data, &util::read_bytes(stub_fdt.path())?])?;
            let signed = sign_bootstub(ctx, out, &req.bct, &resigned_stub, text_base)?;
            let signed_data = util::read_bytes(&signed)?;
            if signed_data.len() != signed_len {
                return Err(Error::command(format!(
                    "signed image size changed from {signed_len} to {} after updating fdt",
                    signed_data.len()
                )));
            }
            concat(&image, &[&signed_data, &postload_data])?;
            Ok(Bundle {
                fdt: fdt_path.clone(),
                bootstub: stub_with_postload,
                signed,
                image,
                text_base,
            })
        })
        .and_then(|bundle| {
            write_manifest(req, &bundle)?;
            Ok(bundle)
        })
    }
}

fn write_manifest(req: &BundleRequest, bundle: &Bundle) -> Result<()> {
    let manifest = json!({
        "board": req.board,
        "created": chrono::Utc::now().to_rfc3339(),
        "text_base": format!("{:#x}", bundle.text_base),
        "inputs": {
            "uboot": req.uboot,
            "bct": req.bct,
            "fdt": req.fdt,
            "postload": req.postload,
        },
        "files": {
            "fdt": bundle.fdt,
            "bootstub": bundle.bootstub,
            "signed": bundle.signed,
            "image": bundle.image,
        },
    });
    util::write_json_pretty(&req.outdir.join("bundle.json"), &manifest)
}
