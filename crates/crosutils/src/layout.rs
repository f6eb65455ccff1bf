use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

fn default_src_root() -> String {
    "/mnt/host/source/src".into()
}

fn default_build_root() -> String {
    "/build".into()
}

/// `[paths]`: where the source checkout and board sysroots live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub src_root: String,
    pub build_root: String,
    pub aliases: BTreeMap<String, String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            src_root: default_src_root(),
            build_root: default_build_root(),
            aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub src_root: PathBuf,
    pub build_root: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl Layout {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: PathsConfig = doc.section("paths")?;
        Self::from_config(&cfg)
    }

    pub fn from_config(cfg: &PathsConfig) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| Error::io(format!("cwd error: {e}")))?;
        let src_root = rooted(&cwd, &cfg.src_root)?;
        let build_root = rooted(&cwd, &cfg.build_root)?;

        let mut named_dirs = BTreeMap::new();
        named_dirs.insert("src".to_string(), src_root.clone());
        named_dirs.insert("build".to_string(), build_root.clone());
        for (name, raw) in &cfg.aliases {
            let key = name.trim();
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(Error::input(format!(
                    "paths.aliases key '{key}' is invalid (allowed: a-zA-Z0-9_-)"
                )));
            }
            if named_dirs.contains_key(key) {
                return Err(Error::input(format!("paths.aliases key '{key}' is reserved")));
            }
            named_dirs.insert(key.to_string(), rooted(&src_root, raw)?);
        }

        Ok(Self {
            src_root,
            build_root,
            named_dirs,
        })
    }

    // `@alias/rest` expands from the named dirs, absolute paths pass through,
    // anything else is taken relative to the current directory.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::input("empty path"));
        }
        let Some(after_at) = raw.strip_prefix('@') else {
            let cwd = std::env::current_dir().map_err(|e| Error::io(format!("cwd error: {e}")))?;
            return rooted(&cwd, raw);
        };
        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), r),
            None => (after_at.trim(), ""),
        };
        let base = self.named_dirs.get(alias).ok_or_else(|| {
            let known = self.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
            Error::input(format!(
                "unknown path alias '{alias}' in '{raw}' (known: {known})"
            ))
        })?;
        Ok(if rest.is_empty() {
            base.clone()
        } else {
            base.join(rest)
        })
    }

    pub fn chromiumos_overlay(&self) -> PathBuf {
        self.src_root.join("third_party").join("chromiumos-overlay")
    }

    pub fn board_root(&self, board: &str) -> PathBuf {
        self.build_root.join(board)
    }

    /// Board named in `<src_root>/scripts/.default_board`, if any.
    pub fn default_board(&self) -> Option<String> {
        let raw = fs::read_to_string(self.src_root.join("scripts").join(".default_board")).ok()?;
        raw.split_whitespace().next().map(ToOwned::to_owned)
    }
}

fn rooted(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::input("empty path in [paths]"));
    }
    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}
