use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub const CONFIG_ENV: &str = "CROSUTILS_CONFIG";

const KNOWN_TABLES: &[&str] = &[
    "paths",
    "tools",
    "stateful",
    "profile",
    "remote_merge",
    "firmware",
];

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    /// File the document was loaded from; `None` for built-in defaults.
    pub path: Option<PathBuf>,
    pub value: Value,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        Self {
            path: None,
            value: Value::Table(Default::default()),
        }
    }
}

impl ConfigDoc {
    pub fn from_value(value: Value) -> Result<Self> {
        let doc = Self { path: None, value };
        doc.check_tables()?;
        Ok(doc)
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn has_table(&self, path: &str) -> bool {
        self.value_path(path).is_some_and(Value::is_table)
    }

    /// Deserialize a section, falling back to its `Default` when absent.
    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        let Some(v) = self.value_path(path) else {
            return Ok(T::default());
        };
        v.clone()
            .try_into()
            .map_err(|e| Error::input(format!("invalid config at '{path}': {e}")))
    }

    fn check_tables(&self) -> Result<()> {
        let Some(tbl) = self.value.as_table() else {
            return Err(Error::input("config root must be a table"));
        };
        for key in tbl.keys() {
            if !KNOWN_TABLES.contains(&key.as_str()) {
                return Err(Error::input(format!(
                    "unknown config table '{key}' (known: {})",
                    KNOWN_TABLES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Deep merge: tables merge key by key, anything else in `overlay` wins.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference.trim());
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(file: &Path, tbl: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::input(format!(
            "'imports' in {} must be an array of strings",
            file.display()
        )));
    };
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(Ok(s)),
            _ => Some(Err(Error::input(format!(
                "invalid imports entry in {} (expected string)",
                file.display()
            )))),
        })
        .collect()
}

// Imports may appear at any table level; the importing table's own keys win.
fn inline_imports(file: &Path, value: &mut Value, seen: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            merge(&mut acc, load_value(&resolve_ref(file, &imp), seen)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, child) in tbl.iter_mut() {
        inline_imports(file, child, seen)?;
    }
    Ok(())
}

fn load_value(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key.clone()) {
        return Err(Error::input(format!(
            "config import cycle detected at {}",
            key.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::input(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::input(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let parent = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .and_then(|v| v.as_str().map(ToOwned::to_owned));
    if let Some(parent) = parent {
        out = load_value(&resolve_ref(path, &parent), seen)?;
    }

    inline_imports(path, &mut value, seen)?;
    merge(&mut out, value);

    seen.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut seen = HashSet::new();
    let value = load_value(path, &mut seen)?;
    let doc = ConfigDoc {
        path: Some(path.to_path_buf()),
        value,
    };
    doc.check_tables()?;
    Ok(doc)
}

/// Load the explicit config file, else `$CROSUTILS_CONFIG`, else defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<ConfigDoc> {
    if let Some(p) = explicit {
        return load(p);
    }
    match std::env::var(CONFIG_ENV) {
        Ok(p) if !p.trim().is_empty() => load(Path::new(p.trim())),
        _ => Ok(ConfigDoc::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_with_child_winning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(
            dir.join("base.toml"),
            "[paths]\nbuild_root = \"/build\"\nsrc_root = \"/base/src\"\n",
        )
        .expect("write base");
        fs::write(dir.join("tools.toml"), "sshfs = \"/opt/bin/sshfs\"\n").expect("write tools");
        fs::write(
            dir.join("site.toml"),
            "extends = \"base.toml\"\n[paths]\nsrc_root = \"/site/src\"\n[tools]\nimports = [\"tools.toml\"]\nemerge = \"/usr/bin/emerge\"\n",
        )
        .expect("write site");

        let doc = load(&dir.join("site.toml")).expect("load");
        let get = |p: &str| doc.value_path(p).and_then(Value::as_str).map(str::to_owned);
        assert_eq!(get("paths.build_root").as_deref(), Some("/build"));
        assert_eq!(get("paths.src_root").as_deref(), Some("/site/src"));
        assert_eq!(get("tools.sshfs").as_deref(), Some("/opt/bin/sshfs"));
        assert_eq!(get("tools.emerge").as_deref(), Some("/usr/bin/emerge"));
    }

    #[test]
    fn detects_extends_cycle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load(&tmp.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "unexpected: {err}");
    }

    #[test]
    fn rejects_unknown_tables() {
        let value: Value = toml::from_str("[chroot]\nenabled = true\n").unwrap();
        let err = ConfigDoc::from_value(value).unwrap_err();
        assert!(err.to_string().contains("chroot"), "unexpected: {err}");
    }
}
