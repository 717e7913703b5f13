//! `ocifs version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("ocifs version {}", ocifs_core::VERSION);
    println!("runtime {}", ocifs_runtime::VERSION);
    Ok(())
}
