//! `ocifs manifest` command.

use clap::Args;
use ocifs_core::config::{BuildOptions, Platform};
use ocifs_runtime::{ImageReference, ManifestResolver};

use crate::output::{format_bytes, new_table, short_digest};

#[derive(Args)]
pub struct ManifestArgs {
    /// Image reference (e.g., "ubuntu:22.04")
    pub image: String,

    /// Target platform as os/arch[/variant] (default: linux on the host architecture)
    #[arg(long)]
    pub platform: Option<String>,

    /// Registry reached over plain HTTP (repeatable)
    #[arg(long = "insecure", value_name = "HOST")]
    pub insecure: Vec<String>,

    /// Print the resolved manifest as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ManifestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let platform = match &args.platform {
        Some(p) => p.parse::<Platform>()?,
        None => Platform::host_linux(),
    };
    // Validates the platform fields the same way `build` does.
    let options = BuildOptions::builder().platform(platform).build()?;

    let reference = ImageReference::parse(&args.image)?;
    let registry = super::registry_client(&args.insecure)?;
    let manifest = ManifestResolver::new(registry)
        .resolve(&reference, options.platform())
        .await?;

    if args.json {
        let layers: Vec<_> = manifest
            .layers
            .iter()
            .map(|l| {
                serde_json::json!({
                    "mediaType": l.media_type,
                    "digest": l.digest,
                    "size": l.size,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "reference": reference.full_reference(),
            "platform": options.platform().to_string(),
            "digest": manifest.digest,
            "mediaType": manifest.media_type,
            "layers": layers,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Reference: {}", reference.full_reference());
    println!("Platform:  {}", options.platform());
    println!("Digest:    {}", manifest.digest);
    println!();

    let mut table = new_table(&["#", "LAYER", "SIZE", "MEDIA TYPE"]);
    for (i, layer) in manifest.layers.iter().enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            short_digest(&layer.digest).to_string(),
            format_bytes(layer.size),
            layer.media_type.clone(),
        ]);
    }
    println!("{table}");
    println!();
    println!(
        "{} layers, {} total",
        manifest.layers.len(),
        format_bytes(manifest.total_layer_size())
    );
    Ok(())
}
