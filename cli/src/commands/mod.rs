//! CLI command definitions and dispatch.

mod auth;
mod build;
mod manifest;
mod version;

use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use ocifs_runtime::{CredentialSelector, CredentialStore, HttpRegistryClient};

/// Default registry for `login` and `logout`.
const DEFAULT_REGISTRY: &str = "docker.io";

/// ocifs - build ext4 root filesystems from OCI images.
#[derive(Parser)]
#[command(name = "ocifs", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v error, -vv info, -vvv debug, -vvvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a rootfs image from an OCI image reference
    Build(build::BuildArgs),
    /// Resolve an image and list the layers of the selected manifest
    Manifest(manifest::ManifestArgs),
    /// Log in to a container registry
    Login(auth::LoginArgs),
    /// Log out from a container registry
    Logout(auth::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Registry client with environment credentials plus every login saved by
/// `ocifs login`.
pub(crate) fn registry_client<I, S>(
    insecure: I,
) -> Result<Arc<HttpRegistryClient>, Box<dyn std::error::Error>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut selector = CredentialSelector::from_env();
    match CredentialStore::open_default() {
        Ok(store) => selector = selector.with_credential_store(&store)?,
        Err(e) => tracing::debug!(error = %e, "No credential store"),
    }
    let client = HttpRegistryClient::new(Arc::new(selector)).with_insecure_registries(insecure);
    Ok(Arc::new(client))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let verbosity = cli.verbose;
    match cli.command {
        Command::Build(args) => build::execute(args, verbosity).await,
        Command::Manifest(args) => manifest::execute(args).await,
        Command::Login(args) => auth::login(args).await,
        Command::Logout(args) => auth::logout(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::parse_from(["ocifs", "-vvv", "version"]);
        assert_eq!(cli.verbose, 3);
        let cli = Cli::parse_from(["ocifs", "version"]);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_verbose_after_subcommand() {
        let cli = Cli::parse_from(["ocifs", "build", "alpine", "-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Build(_)));
    }
}
