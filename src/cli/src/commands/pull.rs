//! `rootpull pull` command.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use rootpull_image::Store;

#[derive(Args)]
pub struct PullArgs {
    /// Container url (e.g., "ubuntu:latest", "gcr.io/google-containers/etcd:3.3.10")
    pub container: String,

    /// The destination folder
    pub dest: String,

    /// Provider authentication; for GCR the path to a service account json
    /// file with the devstorage.read_only scope (env: ROOTPULL_AUTH)
    #[arg(long)]
    pub auth: Option<String>,

    /// Force the given architecture, e.g. "amd64" or "arm64"; requires
    /// multi-arch support by the container (env: ROOTPULL_ARCH)
    #[arg(long)]
    pub arch: Option<String>,

    /// Force the given OS, e.g. "linux"; requires multi-arch support by the
    /// container (env: ROOTPULL_OS)
    #[arg(long)]
    pub os: Option<String>,

    /// Cache folder; the special value "no" uses a temporary folder for the
    /// lifetime of the process (env: ROOTPULL_CACHE)
    #[arg(long)]
    pub cache: Option<String>,

    /// Remove the destination before pulling. Only works if the destination
    /// has at least three path separators, so /var/roots/ubuntu can be
    /// force-removed, but / or /var/lib cannot.
    #[arg(long)]
    pub force: bool,
}

pub async fn execute(args: PullArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = super::interrupt_token();

    // set up the cache, keeping a temporary one alive until we're done
    let mut tempdir = None;
    let cache_flag = super::flag_or_env(args.cache.clone(), rootpull_core::CACHE_ENV);

    let cache: PathBuf = if cache_flag.eq_ignore_ascii_case("no") {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_path_buf();
        tempdir = Some(dir);
        path
    } else {
        rootpull_core::resolve_cache_dir(Some(cache_flag.as_str()))
    };

    fs::create_dir_all(&cache)?;
    let store = Store::new(&cache);

    // create the destination
    if args.force {
        // let's not be responsible for wiping out an actual root fs
        if !removal_is_safe(&args.dest) {
            return Err(
                format!("not enough path separators to force-remove: {}", args.dest).into(),
            );
        }

        if Path::new(&args.dest).exists() {
            fs::remove_dir_all(&args.dest)?;
        }
    }

    fs::create_dir_all(&args.dest)?;

    // pull & extract the image
    let remote =
        super::new_remote(&args.container, args.auth, args.arch, args.os, cancel.clone()).await?;

    tracing::info!(container = %args.container, dest = %args.dest, "pulling");
    store.extract(&cancel, &remote, Path::new(&args.dest)).await?;

    drop(tempdir);
    Ok(())
}

/// True if the destination is deep enough to be force-removed.
fn removal_is_safe(dest: &str) -> bool {
    dest.matches('/').count() > 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_destinations_are_refused() {
        for dest in ["/", "/var", "/var/lib", "relative", "a/b"] {
            assert!(!removal_is_safe(dest), "{dest} should be refused");
        }
    }

    #[test]
    fn test_deep_destinations_are_allowed() {
        for dest in ["/var/roots/ubuntu", "/home/user/roots/x"] {
            assert!(removal_is_safe(dest), "{dest} should be allowed");
        }
    }
}
