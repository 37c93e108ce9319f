//! `rootpull purge` command.

use std::fs;

use clap::Args;
use rootpull_image::Store;

#[derive(Args)]
pub struct PurgeArgs {
    /// Cache folder to purge (env: ROOTPULL_CACHE)
    #[arg(long)]
    pub cache: Option<String>,
}

pub async fn execute(args: PurgeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cache = rootpull_core::resolve_cache_dir(args.cache.as_deref());

    // refuse to purge folders that do not look like a cache
    let mut valid = false;
    let mut empty = true;

    for entry in fs::read_dir(&cache)? {
        empty = false;
        if entry?.file_name() == "layers" {
            valid = true;
            break;
        }
    }

    if empty || !valid {
        return Err(format!("not a cache directory: {}", cache.display()).into());
    }

    Store::new(&cache).purge().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_refuses_directories_without_layers() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("unrelated"), "file").unwrap();

        let err = execute(PurgeArgs {
            cache: Some(tmp.path().to_string_lossy().into_owned()),
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("not a cache directory"));
    }

    #[tokio::test]
    async fn test_refuses_empty_directories() {
        let tmp = TempDir::new().unwrap();

        let err = execute(PurgeArgs {
            cache: Some(tmp.path().to_string_lossy().into_owned()),
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("not a cache directory"));
    }

    #[tokio::test]
    async fn test_purges_a_real_cache() {
        let tmp = TempDir::new().unwrap();

        // materialize the cache structure with one unused layer
        let store = Store::new(tmp.path());
        fs::write(store.layer_path("sha256:unused"), "blob").unwrap();

        execute(PurgeArgs {
            cache: Some(tmp.path().to_string_lossy().into_owned()),
        })
        .await
        .unwrap();

        assert!(!store.layer_path("sha256:unused").exists());
    }
}
