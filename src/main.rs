// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Command-line entry point. */

use {
    clap::{Parser, Subcommand},
    debmill::{app::App, config::Config, error::Result},
    std::path::PathBuf,
    tracing::error,
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "debmill", about = "Aggregate upstream feeds into a signed APT repository")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/debmill/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify packages from configured feeds.
    Fetch {
        /// Repositories to fetch; all when omitted.
        repositories: Vec<String>,
    },

    /// Compose and sign the APT repository tree.
    Generate {
        /// Repositories to generate; all when omitted.
        repositories: Vec<String>,
    },

    /// Fetch, then generate.
    Run {
        /// Repositories to process; all when omitted.
        repositories: Vec<String>,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let app = App::new(config)?;

    match cli.command {
        Command::Fetch { repositories } => app.fetch(&repositories).await,
        Command::Generate { repositories } => app.generate(&repositories).await,
        Command::Run { repositories } => {
            app.fetch(&repositories).await?;
            app.generate(&repositories).await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
