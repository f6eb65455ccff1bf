//! Stateful partition update from a devserver payload.
//!
//! The payload is a gzipped tarball holding `var_new/` and `dev_image_new/`.
//! After extraction a marker file tells the next boot what to do with them:
//! empty means swap them in, `clobber` means wipe the partition first.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::layout::Layout;
use crate::modules::util;

const VAR_NEW: &str = "var_new";
const DEV_IMAGE_NEW: &str = "dev_image_new";
const CLOBBER: &str = "clobber";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatefulChange {
    /// Keep the existing stateful contents, swap in the new payload.
    Old,
    /// Wipe the stateful partition on next boot.
    Clean,
    /// Forget any pending update.
    Reset,
}

impl FromStr for StatefulChange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "old" => Ok(Self::Old),
            "clean" => Ok(Self::Clean),
            "reset" => Ok(Self::Reset),
            other => Err(Error::input(format!(
                "invalid stateful change '{other}' (expected old, clean or reset)"
            ))),
        }
    }
}

impl StatefulChange {
    /// Marker body for this mode; `None` means the marker must not exist.
    pub fn marker_content(self) -> Option<&'static str> {
        match self {
            Self::Old => Some(""),
            Self::Clean => Some(CLOBBER),
            Self::Reset => None,
        }
    }
}

fn default_stateful_dir() -> String {
    "/mnt/stateful_partition".into()
}

fn default_lsb_release() -> String {
    "/etc/lsb-release".into()
}

fn default_payload_name() -> String {
    "stateful.tgz".into()
}

fn default_marker_name() -> String {
    ".update_available".into()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatefulConfig {
    pub stateful_dir: String,
    pub lsb_release: String,
    pub payload_name: String,
    pub marker_name: String,
    pub timeout_secs: u64,
}

impl Default for StatefulConfig {
    fn default() -> Self {
        Self {
            stateful_dir: default_stateful_dir(),
            lsb_release: default_lsb_release(),
            payload_name: default_payload_name(),
            marker_name: default_marker_name(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatefulUpdateOptions {
    pub change: StatefulChange,
    /// Explicit payload URL; otherwise derived from lsb-release.
    pub url: Option<String>,
    pub stateful_dir: PathBuf,
    pub lsb_release: PathBuf,
    pub payload_name: String,
    pub marker_name: String,
    pub timeout: Duration,
}

impl StatefulUpdateOptions {
    pub fn from_config(
        cfg: &StatefulConfig,
        layout: &Layout,
        change: StatefulChange,
        url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            change,
            url: url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
            stateful_dir: layout.resolve(&cfg.stateful_dir)?,
            lsb_release: layout.resolve(&cfg.lsb_release)?,
            payload_name: cfg.payload_name.clone(),
            marker_name: cfg.marker_name.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        })
    }

    pub fn from_doc(
        doc: &ConfigDoc,
        layout: &Layout,
        change: StatefulChange,
        url: Option<String>,
    ) -> Result<Self> {
        let cfg: StatefulConfig = doc.section("stateful")?;
        Self::from_config(&cfg, layout, change, url)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.stateful_dir.join(&self.marker_name)
    }
}

/// Parse `KEY=VALUE` lines; CR/LF are trimmed and blank or `#` lines skipped.
pub fn parse_lsb_release(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(|l| l.trim_end_matches(|c: char| c == '\r' || c == '\n'))
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Payload URL served by the devserver named in lsb-release.
pub fn payload_url_from_lsb(lsb: &BTreeMap<String, String>, payload_name: &str) -> Result<String> {
    let server = ["CHROMEOS_DEVSERVER", "CHROMEOS_AUSERVER"]
        .iter()
        .filter_map(|k| lsb.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .ok_or_else(|| Error::input("no CHROMEOS_DEVSERVER URL found in lsb-release"))?;

    // The update server URL carries an /update endpoint; static payloads live beside it.
    let base = server.trim_end_matches('/');
    let base = base.strip_suffix("/update").unwrap_or(base);
    Ok(format!("{base}/static/{payload_name}"))
}

fn lsb_release_path(opts: &StatefulUpdateOptions) -> PathBuf {
    let on_stateful = opts.stateful_dir.join("etc").join("lsb-release");
    if on_stateful.is_file() {
        on_stateful
    } else {
        opts.lsb_release.clone()
    }
}

pub fn resolve_payload_url(opts: &StatefulUpdateOptions) -> Result<String> {
    if let Some(url) = &opts.url {
        return Ok(url.clone());
    }
    let path = lsb_release_path(opts);
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::input(format!("failed to read {}: {e}", path.display())))?;
    payload_url_from_lsb(&parse_lsb_release(&raw), &opts.payload_name)
}

/// Drop the marker and any half-applied payload directories.
pub fn reset_state(opts: &StatefulUpdateOptions) -> Result<()> {
    util::remove_path(&opts.marker_path())?;
    util::remove_path(&opts.stateful_dir.join(VAR_NEW))?;
    util::remove_path(&opts.stateful_dir.join(DEV_IMAGE_NEW))
}

fn download(ctx: &ExecCtx, url: &str, timeout: Duration, dst: &mut fs::File) -> Result<u64> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::new(ErrorKind::Network, format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| Error::from(e).context(format!("download of {url} failed")))?;
    if !res.status().is_success() {
        return Err(Error::new(
            ErrorKind::Network,
            format!("download of {url} failed with status {}", res.status()),
        ));
    }
    let n = io::copy(&mut res, dst)
        .map_err(|e| Error::new(ErrorKind::Network, format!("reading {url} failed: {e}")))?;
    ctx.log(&format!("downloaded {n} bytes"));
    Ok(n)
}

fn extract(ctx: &ExecCtx, tarball: &Path, dest: &Path) -> Result<()> {
    let mut cmd = ctx.command("tar");
    cmd.arg("--overwrite")
        .arg("-xzf")
        .arg(tarball)
        .arg("-C")
        .arg(dest);
    ctx.run_cmd(cmd)
        .map_err(|e| e.context("failed to extract stateful payload"))
}

fn verify_payload(opts: &StatefulUpdateOptions) -> Result<()> {
    for dir in [VAR_NEW, DEV_IMAGE_NEW] {
        if !opts.stateful_dir.join(dir).is_dir() {
            return Err(Error::input(format!(
                "missing {dir} in stateful payload"
            )));
        }
    }
    Ok(())
}

fn apply_payload(ctx: &mut ExecCtx, opts: &StatefulUpdateOptions, url: &str) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".stateful-payload.")
        .suffix(".tgz")
        .tempfile_in(&opts.stateful_dir)
        .map_err(|e| Error::io(format!("failed to create temp file: {e}")).with_source(e))?;

    ctx.step("stateful.download", |ctx| {
        ctx.log(&format!("downloading stateful payload from {url}"));
        download(ctx, url, opts.timeout, tmp.as_file_mut()).map(|_| ())
    })?;
    ctx.step("stateful.extract", |ctx| {
        extract(ctx, tmp.path(), &opts.stateful_dir)
    })?;
    ctx.step("stateful.verify", |_| verify_payload(opts))
}

pub fn run(opts: StatefulUpdateOptions, ctx: &mut ExecCtx) -> Result<()> {
    if !opts.stateful_dir.is_dir() {
        return Err(Error::input(format!(
            "stateful dir {} does not exist",
            opts.stateful_dir.display()
        )));
    }

    if opts.change == StatefulChange::Reset {
        return ctx.step("stateful.reset", |ctx| {
            ctx.log("resetting stateful update state");
            if ctx.dry_run {
                return Ok(());
            }
            reset_state(&opts)
        });
    }

    let url = resolve_payload_url(&opts)?;
    if ctx.dry_run {
        ctx.log(&format!(
            "DRY-RUN: would fetch {url} into {}",
            opts.stateful_dir.display()
        ));
        return Ok(());
    }

    // Remnants of an earlier attempt would otherwise mix with the new payload.
    util::remove_path(&opts.stateful_dir.join(VAR_NEW))?;
    util::remove_path(&opts.stateful_dir.join(DEV_IMAGE_NEW))?;

    if let Err(e) = apply_payload(ctx, &opts, &url) {
        tracing::info!("rolling back partial stateful update");
        if let Err(reset_err) = reset_state(&opts) {
            tracing::warn!("cleanup after failed update also failed: {reset_err}");
        }
        return Err(e);
    }

    let content = opts.change.marker_content().unwrap_or_default();
    ctx.step("stateful.mark", |ctx| {
        ctx.log(&format!(
            "marking update available ({})",
            if content.is_empty() { "keep state" } else { content }
        ));
        util::atomic_write_text(&opts.marker_path(), content)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsb_release_with_crlf() {
        let lsb = parse_lsb_release(
            "CHROMEOS_RELEASE_BOARD=x86-mario\r\n# comment\n\nCHROMEOS_DEVSERVER=http://localhost:8080/\n",
        );
        assert_eq!(lsb.get("CHROMEOS_RELEASE_BOARD").map(String::as_str), Some("x86-mario"));
        assert_eq!(
            lsb.get("CHROMEOS_DEVSERVER").map(String::as_str),
            Some("http://localhost:8080/")
        );
        assert_eq!(lsb.len(), 2);
    }

    #[test]
    fn payload_url_strips_update_endpoint() {
        let mut lsb = BTreeMap::new();
        lsb.insert(
            "CHROMEOS_AUSERVER".to_string(),
            "http://devserver:8080/update".to_string(),
        );
        assert_eq!(
            payload_url_from_lsb(&lsb, "stateful.tgz").expect("url"),
            "http://devserver:8080/static/stateful.tgz"
        );

        lsb.insert(
            "CHROMEOS_DEVSERVER".to_string(),
            "http://other:8080/".to_string(),
        );
        assert_eq!(
            payload_url_from_lsb(&lsb, "stateful.tgz").expect("url"),
            "http://other:8080/static/stateful.tgz"
        );
    }

    #[test]
    fn missing_devserver_is_input_error() {
        let err = payload_url_from_lsb(&BTreeMap::new(), "stateful.tgz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn change_modes_map_to_marker_content() {
        assert_eq!("old".parse::<StatefulChange>().unwrap().marker_content(), Some(""));
        assert_eq!(
            "clean".parse::<StatefulChange>().unwrap().marker_content(),
            Some("clobber")
        );
        assert_eq!("reset".parse::<StatefulChange>().unwrap().marker_content(), None);
        assert!("wipe".parse::<StatefulChange>().is_err());
    }

    #[test]
    fn stateful_lsb_release_takes_precedence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("etc")).expect("mkdir");
        fs::write(
            root.join("etc/lsb-release"),
            "CHROMEOS_DEVSERVER=http://stateful:8080\n",
        )
        .expect("write");
        fs::write(root.join("system-lsb"), "CHROMEOS_DEVSERVER=http://system:8080\n")
            .expect("write");
        let layout = Layout::from_config(&Default::default()).expect("layout");
        let mut opts = StatefulUpdateOptions::from_config(
            &StatefulConfig::default(),
            &layout,
            StatefulChange::Old,
            None,
        )
        .expect("options");
        opts.stateful_dir = root.to_path_buf();
        opts.lsb_release = root.join("system-lsb");
        assert_eq!(
            resolve_payload_url(&opts).expect("url"),
            "http://stateful:8080/static/stateful.tgz"
        );
    }

    #[test]
    fn config_paths_expand_aliases() {
        let layout = Layout::from_config(&crate::layout::PathsConfig {
            build_root: "/build".into(),
            ..Default::default()
        })
        .expect("layout");
        let doc = ConfigDoc::from_value(
            toml::from_str(
                "[stateful]\nstateful_dir = \"@build/stateful\"\nlsb_release = \"@build/etc/lsb-release\"\n",
            )
            .expect("toml"),
        )
        .expect("doc");
        let opts = StatefulUpdateOptions::from_doc(&doc, &layout, StatefulChange::Clean, None)
            .expect("options");
        assert_eq!(opts.stateful_dir, PathBuf::from("/build/stateful"));
        assert_eq!(opts.lsb_release, PathBuf::from("/build/etc/lsb-release"));
        assert_eq!(opts.marker_path(), PathBuf::from("/build/stateful/.update_available"));
    }
}
