use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use prospector_core::{NewProspectJob, ProspectFilters};
use prospector_pipeline::{JobSubmitter, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "prospector-cli")]
#[command(about = "Prospector lead-prospecting pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll for queued jobs and process them.
    Work {
        /// Run a single tick, wait for its jobs, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API.
    Serve,
    /// Queue a prospecting job.
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    actor: i64,
    #[arg(long, default_value_t = 25)]
    size: i32,
    /// Provider id from providers.yaml; repeatable.
    #[arg(long = "provider", required = true)]
    providers: Vec<String>,
    #[arg(long = "title")]
    titles: Vec<String>,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    industry: Option<String>,
    prompt: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PROSPECTOR_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Work { once: false }) {
        Commands::Work { once } => {
            if let Some(report) = prospector_pipeline::run_worker_from_env(once).await? {
                println!(
                    "work tick complete: claimed={} lost_races={}",
                    report.claimed, report.lost
                );
            }
        }
        Commands::Migrate => {
            let config = WorkerConfig::from_env();
            let store = prospector_pipeline::connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            prospector_web::serve_from_env().await?;
        }
        Commands::Submit(args) => {
            let config = WorkerConfig::from_env();
            let store = prospector_pipeline::connect_store(&config).await?;
            let submitter = JobSubmitter::new(store, &config);
            let job = submitter
                .submit(NewProspectJob {
                    tenant_id: args.tenant,
                    actor_id: args.actor,
                    prompt: args.prompt,
                    size: args.size,
                    providers: args.providers,
                    filters: ProspectFilters {
                        titles: args.titles,
                        country: args.country,
                        industry: args.industry,
                    },
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}
