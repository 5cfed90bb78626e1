use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "enerlake")]
#[command(about = "Building energy lakehouse backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the cron rebuild scheduler when enabled).
    Serve,
    /// Rebuild silver snapshots from bronze, for one entity or all of them.
    Rebuild {
        #[arg(long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => enerlake_web::serve_from_env().await?,
        Commands::Rebuild { entity } => rebuild(entity).await?,
    }
    Ok(())
}

async fn rebuild(entity: Option<String>) -> Result<()> {
    use enerlake_pipeline::{all_specs, spec_for, Lake, LakeConfig};
    use enerlake_storage::LocalBlobStore;
    use std::sync::Arc;

    let config = LakeConfig::from_env();
    let lake = Lake::new(Arc::new(LocalBlobStore::new(&config.data_dir)));

    let specs = match entity {
        Some(name) => vec![spec_for(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown entity: {name}"))?],
        None => all_specs().to_vec(),
    };
    for spec in specs {
        let rows = lake.rebuild(spec).await?;
        println!("{}: {} row(s)", spec.entity, rows);
    }
    Ok(())
}
