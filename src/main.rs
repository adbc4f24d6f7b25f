use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use featherbone::featherbone_core::{Applied, Catalog, Model, SubscriptionChannel};
use featherbone::{open_session, render, ClientConfig, HttpDataSource};

#[derive(Parser)]
#[command(name = "fb")]
#[command(about = "Inspect and watch Featherbone data from the command line")]
struct Cli {
    /// Server URL (overrides config file and FEATHERBONE_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the feather inheritance tree, or one feather's properties
    Feathers { name: Option<String> },
    /// Fetch one record
    Get { feather: String, id: String },
    /// Fetch a collection
    List {
        feather: String,
        /// Include records flagged as deleted
        #[arg(long)]
        show_deleted: bool,
    },
    /// Subscribe to a collection and log pushed changes
    Watch { feather: String },
}

/// Initialize tracing with output to stderr so stdout stays clean for data.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "featherbone=info,featherbone_core=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn load_catalog(client: &HttpDataSource) -> anyhow::Result<Catalog> {
    let payload = client
        .fetch_catalog()
        .await
        .context("Failed to fetch catalog")?;
    let mut catalog = Catalog::new();
    catalog.load(payload).context("Invalid catalog")?;
    Ok(catalog)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = ClientConfig::load().with_overrides(cli.url, None);
    let client = HttpDataSource::from_config(&config);
    let mut catalog = load_catalog(&client).await?;

    match cli.command {
        Commands::Feathers { name: None } => {
            print!("{}", render::render_tree(&catalog));
        }
        Commands::Feathers { name: Some(name) } => {
            let Some(feather) = catalog.get_feather(&name) else {
                bail!("Unknown feather: {}", name);
            };
            print!("{}", render::render_properties(&feather));
        }
        Commands::Get { feather, id } => {
            let Some(feather) = catalog.get_feather(&feather) else {
                bail!("Unknown feather: {}", feather);
            };
            let model = Model::from_fetched(
                feather,
                catalog.factories(),
                &serde_json::json!({ "id": id }),
            );
            model.fetch(&client).await?;
            let instance = model.borrow();
            println!("{}", serde_json::to_string_pretty(&instance.to_json())?);
            tracing::info!(state = %instance.state(), "fetched");
        }
        Commands::List {
            feather,
            show_deleted,
        } => {
            let list = catalog.list(&feather)?.with_show_deleted(show_deleted);
            let count = list.fetch(&client, &mut catalog, false).await?;
            let records: Vec<_> = list.models().iter().map(|m| m.borrow().to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
            tracing::info!(feather = %feather, count, "listed");
        }
        Commands::Watch { feather } => {
            let mut session = open_session(&client, &config).await?;
            catalog.set_event_key(session.event_key.clone());

            let list = catalog.list(&feather)?;
            let count = list.fetch(&client, &mut catalog, true).await?;
            tracing::info!(feather = %feather, count, "watching");

            let channel = SubscriptionChannel::new();
            let stopped = channel
                .listen(&mut session.stream, &mut catalog, |applied| match applied {
                    Applied::UnknownSubscription(_) => tracing::debug!(?applied, "ignored"),
                    _ => tracing::info!(?applied, "applied"),
                })
                .await?;
            tracing::info!(?stopped, "stopped watching");
        }
    }

    Ok(())
}
