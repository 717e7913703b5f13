//! ocifs CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ocifs_cli::commands::{dispatch, Cli};

/// Log filter for a `-v` count. `RUST_LOG` takes precedence.
fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "off",
            1 => "error",
            2 => "info",
            3 => "debug",
            _ => "trace",
        })
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(filter_for(cli.verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::select! {
        result = dispatch(cli) => result,
        _ = tokio::signal::ctrl_c() => Err("interrupted".into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
