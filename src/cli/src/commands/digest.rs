//! `rootpull digest` command.

use clap::Args;

#[derive(Args)]
pub struct DigestArgs {
    /// Container url (e.g., "ubuntu:latest", "gcr.io/google-containers/etcd:3.3.10")
    pub container: String,

    /// Provider authentication (env: ROOTPULL_AUTH)
    #[arg(long)]
    pub auth: Option<String>,

    /// Force the given architecture (env: ROOTPULL_ARCH)
    #[arg(long)]
    pub arch: Option<String>,

    /// Force the given OS (env: ROOTPULL_OS)
    #[arg(long)]
    pub os: Option<String>,
}

pub async fn execute(args: DigestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = super::interrupt_token();

    let remote = super::new_remote(&args.container, args.auth, args.arch, args.os, cancel).await?;

    println!("{}", remote.digest().await?);
    Ok(())
}
