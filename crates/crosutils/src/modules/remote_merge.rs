//! Merge board packages straight onto a device mounted over SSHFS.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempDir;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::layout::Layout;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteMergeConfig {
    pub user: String,
    /// Install target below the mount root unless `--root-install` is given.
    pub stateful_subpath: String,
    pub sshfs_options: Vec<String>,
    /// Parent directory for the temporary mount point.
    pub mount_prefix: Option<String>,
}

impl Default for RemoteMergeConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            stateful_subpath: "mnt/stateful_partition/dev_image".into(),
            sshfs_options: vec!["idmap=user".into()],
            mount_prefix: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteMergeOptions {
    pub board: String,
    pub remote: String,
    pub packages: Vec<String>,
    pub unmerge: bool,
    pub jobs: usize,
    pub update_deps: bool,
    pub root_install: bool,
    pub user: String,
    pub stateful_subpath: PathBuf,
    pub sshfs_options: Vec<String>,
    pub mount_prefix: Option<PathBuf>,
}

impl RemoteMergeOptions {
    pub fn from_doc(doc: &ConfigDoc, layout: &Layout) -> Result<Self> {
        let cfg: RemoteMergeConfig = doc.section("remote_merge")?;
        let mount_prefix = cfg
            .mount_prefix
            .as_deref()
            .map(|p| layout.resolve(p))
            .transpose()?;
        Ok(Self {
            board: String::new(),
            remote: String::new(),
            packages: Vec::new(),
            unmerge: false,
            jobs: num_cpus::get(),
            update_deps: false,
            root_install: false,
            user: cfg.user,
            stateful_subpath: PathBuf::from(cfg.stateful_subpath.trim_start_matches('/')),
            sshfs_options: cfg.sshfs_options,
            mount_prefix,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.board.trim().is_empty() {
            return Err(Error::input("--board is required"));
        }
        if self.remote.trim().is_empty() {
            return Err(Error::input("--remote is required"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::input("remote user must not be empty"));
        }
        if self.packages.iter().all(|p| p.trim().is_empty()) {
            return Err(Error::input("at least one package is required"));
        }
        if self.jobs == 0 {
            return Err(Error::input("--jobs must be at least 1"));
        }
        if self.update_deps && self.unmerge {
            return Err(Error::input("--update-deps cannot be combined with --unmerge"));
        }
        Ok(())
    }

    fn emerge_tool(&self) -> String {
        format!("emerge-{}", self.board)
    }

    fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
    }

    /// Where packages land inside the mount.
    pub fn install_root(&self, mount: &Path) -> PathBuf {
        if self.root_install {
            mount.to_path_buf()
        } else {
            mount.join(&self.stateful_subpath)
        }
    }
}

/// A remote filesystem mounted on a fresh temp dir, unmounted when dropped.
pub struct MountGuard {
    ctx: ExecCtx,
    // `None` once released.
    mount_point: Option<TempDir>,
}

impl MountGuard {
    pub fn sshfs(
        ctx: &ExecCtx,
        source: &str,
        options: &[String],
        prefix: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("remote-merge.");
        let dir = match prefix {
            Some(p) => builder.tempdir_in(p),
            None => builder.tempdir(),
        }
        .map_err(|e| Error::io(format!("failed to create mount point: {e}")).with_source(e))?;

        let mut cmd = ctx.command("sshfs");
        cmd.arg(source).arg(dir.path());
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        // Nothing is mounted yet if this fails; dropping `dir` removes it.
        ctx.run_cmd(cmd)?;

        Ok(Self {
            ctx: ctx.clone(),
            mount_point: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        self.mount_point
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    fn release(&mut self) {
        let Some(dir) = self.mount_point.take() else {
            return;
        };
        tracing::info!("unmounting {}", dir.path().display());
        let mut cmd = self.ctx.command("fusermount");
        cmd.arg("-u").arg(dir.path());
        if self.ctx.run_cleanup_cmd(cmd) {
            if let Err(e) = dir.close() {
                tracing::warn!("failed to remove mount point: {e}");
            }
        } else {
            // Still mounted: a recursive delete would reach into the device.
            let kept = dir.keep();
            tracing::error!("{} is still mounted; unmount it by hand", kept.display());
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn run(opts: RemoteMergeOptions, ctx: &mut ExecCtx) -> Result<()> {
    opts.validate()?;
    let packages: Vec<&str> = opts.packages().collect();

    if opts.update_deps {
        ctx.step("remote_merge.deps", |ctx| {
            let mut cmd = ctx.command(&opts.emerge_tool());
            cmd.arg("--update")
                .arg("--deep")
                .arg("--onlydeps")
                .arg(format!("--jobs={}", opts.jobs))
                .args(&packages);
            ctx.run_cmd(cmd)
        })?;
    }

    let source = format!("{}@{}:/", opts.user.trim(), opts.remote.trim());
    let mount = ctx.step("remote_merge.mount", |ctx| {
        MountGuard::sshfs(ctx, &source, &opts.sshfs_options, opts.mount_prefix.as_deref())
    })?;
    let target = opts.install_root(mount.path());

    ctx.step("remote_merge.emerge", |ctx| {
        let mut cmd = ctx.command(&opts.emerge_tool());
        cmd.arg(format!("--root={}", target.display()));
        if opts.unmerge {
            cmd.arg("--unmerge");
        } else {
            cmd.arg("--root-deps=rdeps")
                .arg("--usepkgonly")
                .arg(format!("--jobs={}", opts.jobs));
        }
        cmd.args(&packages);
        ctx.run_cmd(cmd)
    })?;

    if !opts.root_install {
        ctx.step("remote_merge.ldconfig", |ctx| {
            let mut cmd = ctx.command("ldconfig");
            cmd.arg("-r").arg(mount.path());
            ctx.run_cmd(cmd)
        })?;
    }

    drop(mount);
    Ok(())
}
