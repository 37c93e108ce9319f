//! CLI command definitions and dispatch.

mod digest;
mod pull;
mod purge;
mod version;

use clap::{Parser, Subcommand};
use rootpull_image::{default_registry, ImageUrl, Platform, Remote};
use tokio_util::sync::CancellationToken;

/// rootpull — download and extract containers.
#[derive(Parser)]
#[command(name = "rootpull", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Download an image and extract it into a destination folder
    Pull(pull::PullArgs),
    /// Purge unused files from the cache
    Purge(purge::PurgeArgs),
    /// Show the latest digest of an image
    Digest(digest::DigestArgs),
    /// Show version information
    Version,
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Pull(args) => pull::execute(args).await,
        Command::Purge(args) => purge::execute(args).await,
        Command::Digest(args) => digest::execute(args).await,
        Command::Version => version::execute(),
    }
}

/// A token that is cancelled once the user interrupts the process.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            cancel.cancel();
        }
    });

    token
}

/// A flag value, falling back to an environment variable when unset.
pub(crate) fn flag_or_env(flag: Option<String>, var: &str) -> String {
    flag.filter(|value| !value.is_empty())
        .or_else(|| std::env::var(var).ok())
        .unwrap_or_default()
}

/// Connect to the remote for the given container reference.
///
/// A platform is bound when an architecture or OS is requested; the missing
/// half defaults to the host architecture and "linux" respectively.
pub(crate) async fn new_remote(
    container: &str,
    auth: Option<String>,
    arch: Option<String>,
    os: Option<String>,
    cancel: CancellationToken,
) -> Result<Remote, Box<dyn std::error::Error>> {
    let auth = flag_or_env(auth, "ROOTPULL_AUTH");
    let arch = flag_or_env(arch, "ROOTPULL_ARCH");
    let os = flag_or_env(os, "ROOTPULL_OS");

    let url = ImageUrl::parse(container)?;

    let registry = default_registry();
    let mut remote = Remote::new(&registry, url, &auth, cancel).await?;

    if !arch.is_empty() || !os.is_empty() {
        remote.with_platform(Platform {
            architecture: if arch.is_empty() {
                host_arch().to_string()
            } else {
                arch
            },
            os: if os.is_empty() { "linux".to_string() } else { os },
        });
    }

    Ok(remote)
}

/// The host architecture, under the name container platforms use for it.
pub(crate) fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
