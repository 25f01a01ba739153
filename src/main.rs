use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use podcrawl::config::Config;
use podcrawl::orchestrator::Orchestrator;
use podcrawl::reconciler::Reconciler;
use podcrawl::storage::{Database, DatabaseError, Episode, Podcast};
use podcrawl::util::validate_feed_url;

#[derive(Parser, Debug)]
#[command(name = "podcrawl", about = "Podcast feed ingestion and scheduling")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, short, value_name = "FILE", default_value = "podcrawl.toml")]
    config: PathBuf,

    /// Override the catalog database path
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and reconcile every podcast that is due
    Run {
        /// Maximum number of podcasts to claim
        #[arg(long)]
        limit: Option<usize>,

        /// Number of concurrent workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Add feed URLs to the catalog
    Add {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Update one podcast now, regardless of its schedule
    Parse {
        #[arg(value_name = "ID")]
        id: i64,
    },
    /// Print a podcast and its episodes as JSON
    Show {
        #[arg(value_name = "ID")]
        id: i64,
    },
    /// Create a category that feed categories are matched against
    AddCategory {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[derive(Serialize)]
struct PodcastDetail {
    #[serde(flatten)]
    podcast: Podcast,
    categories: Vec<String>,
    episodes: Vec<Episode>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Command::Run { limit, workers } = &args.command {
        if let Some(limit) = limit {
            config.limit = *limit;
        }
        if let Some(workers) = workers {
            config.workers = *workers;
        }
        config.validate()?;
    }

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let reconciler = Arc::new(
        Reconciler::from_config(db.clone(), &config).context("Failed to build HTTP client")?,
    );

    match args.command {
        Command::Run { .. } => {
            let orchestrator = Orchestrator::new(Arc::clone(&reconciler), config.workers);
            let summary = orchestrator.run(config.limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Add { urls } => {
            for url in urls {
                match validate_feed_url(&url) {
                    Ok(url) => {
                        let id = db.insert_podcast(&url).await?;
                        tracing::info!(podcast_id = id, rss = %url, "Podcast added");
                        println!("{id}\t{url}");
                    }
                    Err(e) => eprintln!("Skipping {url}: {e}"),
                }
            }
        }
        Command::Parse { id } => match reconciler.parse_podcast_id(id).await {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => {
                eprintln!("Podcast {id}: {} ({e})", e.code());
                std::process::exit(2);
            }
        },
        Command::Show { id } => {
            let podcast = db
                .get_podcast(id)
                .await?
                .with_context(|| format!("Podcast {id} not found"))?;
            let detail = PodcastDetail {
                categories: db.get_podcast_categories(id).await?,
                episodes: db.get_episodes(id).await?,
                podcast,
            };
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Command::AddCategory { name } => {
            let id = reconciler.create_category(&name).await?;
            println!("{id}\t{name}");
        }
    }

    Ok(())
}
