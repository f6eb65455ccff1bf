//! Flat device tree access through `fdtget`/`fdtput`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// U-Boot places this word right before its TEXT_BASE.
pub const UBOOT_HEADER_MAGIC: u32 = 0x1234_5678;

/// Tegra images may start with a 16K SPL region ahead of U-Boot proper.
const HEADER_SEARCH_STARTS: [usize; 2] = [0, 0x4000];
const HEADER_SEARCH_BYTES: usize = 160;

/// Find TEXT_BASE in a U-Boot binary by looking for the header magic.
pub fn decode_text_base(data: &[u8]) -> Option<u32> {
    let mut found = false;
    for start in HEADER_SEARCH_STARTS {
        for i in (start..start + HEADER_SEARCH_BYTES).step_by(4) {
            let Some(word) = data.get(i..i + 4) else {
                break;
            };
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if found {
                return Some(value.wrapping_sub(start as u32));
            }
            if value == UBOOT_HEADER_MAGIC {
                found = true;
            }
        }
    }
    None
}

pub fn parse_int(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Edits requested on the command line, applied to the compiled tree.
#[derive(Debug, Clone, Default)]
pub struct FdtChanges {
    /// `Some("none")` clears the boot command.
    pub bootcmd: Option<String>,
    pub bootsecure: bool,
    pub config_str: Vec<(String, String)>,
    pub config_int: Vec<(String, String)>,
    /// Node path or `/aliases` name, with enable (`true`) or disable.
    pub enable: Vec<(String, bool)>,
}

impl FdtChanges {
    pub fn is_empty(&self) -> bool {
        self.bootcmd.is_none()
            && self.config_str.is_empty()
            && self.config_int.is_empty()
            && self.enable.is_empty()
    }
}

/// One `.dtb` file on disk.
pub struct Fdt<'a> {
    ctx: &'a ExecCtx,
    path: PathBuf,
}

impl<'a> Fdt<'a> {
    pub fn new(ctx: &'a ExecCtx, path: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy to `dest` and return a handle on the copy.
    pub fn copy_to(&self, dest: impl Into<PathBuf>) -> Result<Fdt<'a>> {
        let dest = dest.into();
        std::fs::copy(&self.path, &dest).map_err(|e| {
            Error::io(format!(
                "failed to copy {} -> {}: {e}",
                self.path.display(),
                dest.display()
            ))
            .with_source(e)
        })?;
        Ok(Fdt::new(self.ctx, dest))
    }

    fn get(&self, ty: &str, node: &str, prop: &str, default: &str) -> Result<String> {
        let mut cmd = self.ctx.command("fdtget");
        cmd.arg("-t")
            .arg(ty)
            .arg("-d")
            .arg(default)
            .arg(&self.path)
            .arg(node)
            .arg(prop);
        Ok(self.ctx.query(cmd)?.trim().to_string())
    }

    /// String property, empty when missing.
    pub fn get_string(&self, node: &str, prop: &str) -> Result<String> {
        self.get("s", node, prop, "")
    }

    pub fn get_int(&self, node: &str, prop: &str, default: u64) -> Result<u64> {
        let raw = self.get("u", node, prop, &default.to_string())?;
        parse_int(&raw).ok_or_else(|| {
            Error::input(format!(
                "{node}/{prop} in {} is not an integer: '{raw}'",
                self.path.display()
            ))
        })
    }

    fn put(&self, ty: &str, node: &str, prop: &str, value: &str) -> Result<()> {
        let mut cmd = self.ctx.command("fdtput");
        cmd.arg("-p")
            .arg("-t")
            .arg(ty)
            .arg(&self.path)
            .arg(node)
            .arg(prop)
            .arg(value);
        self.ctx.run_scratch_cmd(cmd)
    }

    pub fn put_string(&self, node: &str, prop: &str, value: &str) -> Result<()> {
        self.put("s", node, prop, value)
    }

    pub fn put_int(&self, node: &str, prop: &str, value: u64) -> Result<()> {
        self.put("u", node, prop, &value.to_string())
    }

    /// Set `status` on a node given by path or by `/aliases` name.
    pub fn set_node_enabled(&self, node: &str, enabled: bool) -> Result<()> {
        let target = if node.starts_with('/') {
            node.to_string()
        } else {
            let lookup = self.get_string("/aliases", node)?;
            if lookup.is_empty() {
                tracing::warn!("cannot find alias '{node}'; ignoring");
                return Ok(());
            }
            lookup
        };
        let status = if enabled { "okay" } else { "disabled" };
        self.put_string(&target, "status", status)
    }

    pub fn apply(&self, changes: &FdtChanges) -> Result<()> {
        if let Some(bootcmd) = changes.bootcmd.as_deref() {
            let bootcmd = if bootcmd == "none" { "" } else { bootcmd };
            self.put_string("/config", "bootcmd", bootcmd)?;
            self.put_int("/config", "bootsecure", u64::from(changes.bootsecure))?;
            tracing::info!("boot command: {bootcmd}");
        }
        for (key, value) in &changes.config_str {
            self.put_string("/config", key, value)?;
        }
        for (key, value) in &changes.config_int {
            let n = parse_int(value).ok_or_else(|| {
                Error::input(format!("cannot convert config option '{key}={value}' to integer"))
            })?;
            self.put_int("/config", key, n)?;
        }
        for (node, enabled) in &changes.enable {
            self.set_node_enabled(node, *enabled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_header(at: usize, text_base: u32) -> Vec<u8> {
        let mut data = vec![0u8; 0x4000 + 256];
        data[at..at + 4].copy_from_slice(&UBOOT_HEADER_MAGIC.to_le_bytes());
        data[at + 4..at + 8].copy_from_slice(&text_base.to_le_bytes());
        data
    }

    #[test]
    fn text_base_follows_magic() {
        let data = image_with_header(0x20, 0x00e0_8000);
        assert_eq!(decode_text_base(&data), Some(0x00e0_8000));
    }

    #[test]
    fn text_base_in_spl_region_is_rebased() {
        let data = image_with_header(0x4010, 0x0010_c000);
        assert_eq!(decode_text_base(&data), Some(0x0010_c000 - 0x4000));
    }

    #[test]
    fn missing_magic_or_short_image() {
        assert_eq!(decode_text_base(&[0u8; 64]), None);
        assert_eq!(decode_text_base(&[]), None);
        assert_eq!(decode_text_base(&vec![0u8; 0x5000]), None);
    }

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int(" 0x1000 "), Some(4096));
        assert_eq!(parse_int("0XfF"), Some(255));
        assert_eq!(parse_int("ten"), None);
    }

    #[test]
    fn empty_changes_leave_tree_untouched() {
        assert!(FdtChanges::default().is_empty());
        let changes = FdtChanges {
            enable: vec![("console".into(), false)],
            ..Default::default()
        };
        assert!(!changes.is_empty());
    }
}
