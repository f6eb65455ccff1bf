//! Portage profile selection for a board sysroot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::layout::Layout;
use crate::modules::util;

const DEFAULT_PROFILE_NAME: &str = "base";
const TOOLCHAIN_CONF: &str = "toolchain.conf";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Overlay list (least specific first); skips `cros_overlay_list` when set.
    pub overlays: Vec<String>,
    /// Version directory of the architecture default profile.
    pub default_version: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            overlays: Vec::new(),
            default_version: "10.0".into(),
        }
    }
}

/// Supplies the board's overlays, least specific first.
pub trait OverlaySource {
    fn overlays(&self, ctx: &ExecCtx) -> Result<Vec<PathBuf>>;
}

pub struct StaticOverlays(pub Vec<PathBuf>);

impl OverlaySource for StaticOverlays {
    fn overlays(&self, _ctx: &ExecCtx) -> Result<Vec<PathBuf>> {
        Ok(self.0.clone())
    }
}

/// Asks the `cros_overlay_list` helper.
pub struct OverlayListTool {
    pub board: String,
    pub variant: Option<String>,
    pub board_overlay: Option<PathBuf>,
}

impl OverlaySource for OverlayListTool {
    fn overlays(&self, ctx: &ExecCtx) -> Result<Vec<PathBuf>> {
        let mut cmd = ctx.command("cros_overlay_list");
        cmd.arg("--board").arg(&self.board);
        if let Some(v) = &self.variant {
            cmd.arg("--variant").arg(v);
        }
        if let Some(o) = &self.board_overlay {
            cmd.arg("--board_overlay").arg(o);
        }
        let out = ctx
            .query(cmd)
            .map_err(|e| e.context(format!("cannot list overlays for board '{}'", self.board)))?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ChooseProfileOptions {
    pub board: String,
    pub variant: Option<String>,
    /// Profile name (looked up in overlays) or path to a profile directory.
    pub profile: Option<String>,
    pub board_overlay: Option<PathBuf>,
    pub overlays: Vec<PathBuf>,
    pub toolchain_conf: Option<PathBuf>,
    pub default_version: String,
    pub layout: Layout,
}

impl ChooseProfileOptions {
    pub fn from_doc(doc: &ConfigDoc, layout: Layout, board: String) -> Result<Self> {
        let cfg: ProfileConfig = doc.section("profile")?;
        let overlays = cfg
            .overlays
            .iter()
            .map(|o| layout.resolve(o))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            board,
            variant: None,
            profile: None,
            board_overlay: None,
            overlays,
            toolchain_conf: None,
            default_version: cfg.default_version,
            layout,
        })
    }

    pub fn board_variant(&self) -> String {
        match self.variant.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => format!("{}_{}", self.board, v),
            None => self.board.clone(),
        }
    }

    pub fn make_profile_link(&self) -> PathBuf {
        self.layout
            .board_root(&self.board_variant())
            .join("etc")
            .join("portage")
            .join("make.profile")
    }

    fn overlay_source(&self) -> Box<dyn OverlaySource> {
        if self.overlays.is_empty() {
            Box::new(OverlayListTool {
                board: self.board.clone(),
                variant: self.variant.clone(),
                board_overlay: self.board_overlay.clone(),
            })
        } else {
            Box::new(StaticOverlays(self.overlays.clone()))
        }
    }
}

fn profile_arg_is_path(profile: &str) -> bool {
    profile.contains('/')
}

/// Map a GNU target tuple onto a Portage architecture keyword.
pub fn arch_from_tuple(tuple: &str) -> Result<&'static str> {
    static TABLE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        [
            (r"^x86_64-", "amd64"),
            (r"^i[3-6]86-", "x86"),
            (r"^aarch64-", "arm64"),
            (r"^arm", "arm"),
            (r"^mips", "mips"),
        ]
        .into_iter()
        .filter_map(|(re, arch)| Regex::new(re).ok().map(|r| (r, arch)))
        .collect()
    });
    table
        .iter()
        .find(|(re, _)| re.is_match(tuple))
        .map(|(_, arch)| *arch)
        .ok_or_else(|| Error::input(format!("unable to determine architecture for '{tuple}'")))
}

/// First target tuple listed in a toolchain config file.
pub fn read_toolchain_tuple(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::input(format!("failed to read {}: {e}", path.display())))?;
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .find_map(|l| l.split_whitespace().next())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::input(format!("no toolchain listed in {}", path.display())))
}

fn find_toolchain_conf(explicit: Option<&Path>, specific_first: &[PathBuf]) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    specific_first
        .iter()
        .map(|o| o.join(TOOLCHAIN_CONF))
        .find(|p| p.is_file())
        .ok_or_else(|| Error::input(format!("no {TOOLCHAIN_CONF} found in board overlays")))
}

/// Candidate profile directories in precedence order: explicit path,
/// overlay profiles (most specific overlay first), architecture default.
pub fn profile_candidates(
    profile: Option<&str>,
    specific_first: &[PathBuf],
    chromiumos_overlay: &Path,
    arch: &str,
    default_version: &str,
) -> Vec<PathBuf> {
    let profile = profile.map(str::trim).filter(|p| !p.is_empty());
    let mut out = Vec::new();
    let name = match profile {
        Some(p) if profile_arg_is_path(p) => {
            out.push(PathBuf::from(p));
            DEFAULT_PROFILE_NAME
        }
        Some(p) => p,
        None => DEFAULT_PROFILE_NAME,
    };
    out.extend(specific_first.iter().map(|o| o.join("profiles").join(name)));
    out.push(
        chromiumos_overlay
            .join("profiles")
            .join("default")
            .join("linux")
            .join(arch)
            .join(default_version)
            .join("chromeos"),
    );
    out
}

pub fn select_profile(candidates: &[PathBuf]) -> Result<PathBuf> {
    candidates
        .iter()
        .find(|p| p.is_dir())
        .cloned()
        .ok_or_else(|| {
            let tried = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Error::input(format!("no profile directory exists (tried: {tried})"))
        })
}

/// Only a missing path or an existing symlink may be replaced.
pub fn ensure_replaceable(link: &Path) -> Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if !meta.file_type().is_symlink() => Err(Error::input(format!(
            "{} exists and is not a symbolic link",
            link.display()
        ))),
        _ => Ok(()),
    }
}

/// Point `link` at `target`, replacing any existing symlink atomically.
/// The link is recreated even when it already points at `target`.
#[cfg(unix)]
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;

    ensure_replaceable(link)?;
    let parent = link
        .parent()
        .ok_or_else(|| Error::input(format!("invalid link path {}", link.display())))?;
    util::ensure_dir(parent)?;

    let tmp = parent.join(format!(".make.profile.tmp.{}", std::process::id()));
    util::remove_path(&tmp)?;
    symlink(target, &tmp).map_err(|e| {
        Error::io(format!(
            "failed to create symlink {} -> {}: {e}",
            tmp.display(),
            target.display()
        ))
        .with_source(e)
    })?;
    fs::rename(&tmp, link).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(format!("failed to replace {}: {e}", link.display())).with_source(e)
    })
}

#[cfg(not(unix))]
pub fn replace_symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(Error::input("profile symlinks are only supported on unix"))
}

pub fn run(opts: ChooseProfileOptions, ctx: &mut ExecCtx) -> Result<PathBuf> {
    if opts.board.trim().is_empty() {
        return Err(Error::input("--board is required"));
    }
    let board_root = opts.layout.board_root(&opts.board_variant());
    if !board_root.is_dir() {
        return Err(Error::input(format!(
            "board root {} does not exist; set up the board first",
            board_root.display()
        )));
    }

    let mut overlays = ctx.step("profile.overlays", |ctx| opts.overlay_source().overlays(ctx))?;
    overlays.reverse();
    tracing::debug!(?overlays, "overlays, most specific first");

    let arch = ctx.step("profile.arch", |ctx| {
        let conf = find_toolchain_conf(opts.toolchain_conf.as_deref(), &overlays)?;
        let tuple = read_toolchain_tuple(&conf)?;
        let arch = arch_from_tuple(&tuple)?;
        ctx.log(&format!("toolchain {tuple} -> arch {arch}"));
        Ok(arch)
    })?;

    let candidates = profile_candidates(
        opts.profile.as_deref(),
        &overlays,
        &opts.layout.chromiumos_overlay(),
        arch,
        &opts.default_version,
    );
    let mut profile = select_profile(&candidates)?;
    // The link lives under the board root, so a cwd-relative target would dangle.
    if profile.is_relative() {
        profile = std::path::absolute(&profile).map_err(|e| {
            Error::io(format!("failed to resolve {}: {e}", profile.display())).with_source(e)
        })?;
    }
    if let Some(requested) = opts.profile.as_deref().filter(|p| !profile_arg_is_path(p)) {
        if !profile.ends_with(Path::new("profiles").join(requested)) {
            tracing::warn!(
                "profile '{requested}' not found in any overlay; using {}",
                profile.display()
            );
        }
    }
    if !profile.join("parent").is_file() {
        tracing::warn!("profile {} has no parent file", profile.display());
    }

    let link = opts.make_profile_link();
    ctx.step("profile.link", |ctx| {
        if let Ok(current) = fs::read_link(&link) {
            tracing::warn!(
                "profile already set to {}; replacing",
                current.display()
            );
        }
        ensure_replaceable(&link)?;
        ctx.log(&format!("{} -> {}", link.display(), profile.display()));
        if ctx.dry_run {
            return Ok(());
        }
        replace_symlink(&profile, &link)
    })?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_toolchain_tuples_to_arch() {
        assert_eq!(arch_from_tuple("x86_64-cros-linux-gnu").unwrap(), "amd64");
        assert_eq!(arch_from_tuple("i686-pc-linux-gnu").unwrap(), "x86");
        assert_eq!(arch_from_tuple("armv7a-cros-linux-gnueabi").unwrap(), "arm");
        assert_eq!(arch_from_tuple("aarch64-cros-linux-gnu").unwrap(), "arm64");
        assert_eq!(arch_from_tuple("mipsel-cros-linux-gnu").unwrap(), "mips");
        assert!(arch_from_tuple("riscv64-cros-linux-gnu").is_err());
    }

    #[test]
    fn reads_first_listed_toolchain() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let conf = tmp.path().join("toolchain.conf");
        fs::write(
            &conf,
            "# primary first\n\narmv7a-cros-linux-gnueabi\ni686-pc-linux-gnu\n",
        )
        .expect("write");
        assert_eq!(
            read_toolchain_tuple(&conf).unwrap(),
            "armv7a-cros-linux-gnueabi"
        );
    }

    #[test]
    fn candidate_order_is_override_then_overlays_then_default() {
        let overlays = vec![
            PathBuf::from("/src/private-overlays/overlay-tegra2-private"),
            PathBuf::from("/src/overlays/overlay-tegra2"),
        ];
        let got = profile_candidates(
            Some("/custom/profile"),
            &overlays,
            Path::new("/src/third_party/chromiumos-overlay"),
            "arm",
            "10.0",
        );
        assert_eq!(
            got,
            vec![
                PathBuf::from("/custom/profile"),
                PathBuf::from("/src/private-overlays/overlay-tegra2-private/profiles/base"),
                PathBuf::from("/src/overlays/overlay-tegra2/profiles/base"),
                PathBuf::from(
                    "/src/third_party/chromiumos-overlay/profiles/default/linux/arm/10.0/chromeos"
                ),
            ]
        );

        let named = profile_candidates(
            Some("kernel-next"),
            &overlays[1..],
            Path::new("/co"),
            "x86",
            "10.0",
        );
        assert_eq!(
            named[0],
            PathBuf::from("/src/overlays/overlay-tegra2/profiles/kernel-next")
        );
        assert_eq!(named.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_refuses_regular_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = tmp.path().join("make.profile");
        fs::write(&link, "not a link").expect("write");
        let err = replace_symlink(tmp.path(), &link).unwrap_err();
        assert!(err.to_string().contains("not a symbolic link"), "{err}");
        assert_eq!(fs::read_to_string(&link).unwrap(), "not a link");
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_swaps_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        let link = tmp.path().join("etc/portage/make.profile");
        replace_symlink(&a, &link).expect("first link");
        replace_symlink(&b, &link).expect("relink");
        assert_eq!(fs::read_link(&link).unwrap(), b);
    }
}
