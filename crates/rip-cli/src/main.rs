use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rip_pipeline::{Pipeline, PipelineConfig, Worker};
use rip_store::PgStore;
use rip_web::AppState;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rip")]
#[command(about = "Research ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run the JSON API.
    Serve,
    /// Process queued jobs.
    Worker {
        /// Run a single job and exit.
        #[arg(long)]
        once: bool,
        #[arg(long)]
        worker_id: Option<String>,
    },
    CreateRun {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        objective: String,
    },
    /// Upload a `run_bundle_v1` JSON file.
    SubmitBundle {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        run: Uuid,
        file: PathBuf,
        /// Park the run in `needs_review` instead of ingesting.
        #[arg(long)]
        accept_only: bool,
    },
    Approve {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        run: Uuid,
    },
    /// Attach URLs to a run and queue their acquisition.
    AddSources {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        run: Uuid,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Queue canonical resolution for a run.
    Resolve {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        run: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rip=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    let store = PgStore::connect(&config.database_url, 10)
        .await
        .with_context(|| format!("connecting to {}", redact(&config.database_url)))?;

    if let Commands::Migrate = cli.command {
        store.migrate().await.context("running migrations")?;
        println!("migrations applied");
        return Ok(());
    }

    let pipeline = Arc::new(Pipeline::new(Arc::new(store), &config)?);

    match cli.command {
        Commands::Migrate => {}
        Commands::Serve => {
            rip_web::serve(AppState::new(pipeline), config.web_port).await?;
        }
        Commands::Worker { once, worker_id } => {
            let worker_id = worker_id.unwrap_or_else(Worker::default_worker_id);
            let worker = Worker::new(pipeline, worker_id, config.worker_poll_interval);
            if once {
                match worker.run_once().await? {
                    Some(report) => print_json(&report)?,
                    None => println!("queue empty"),
                }
            } else {
                worker
                    .run_until(async {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("shutdown requested");
                        }
                    })
                    .await;
            }
        }
        Commands::CreateRun { tenant, objective } => {
            print_json(&pipeline.create_run(tenant, &objective).await?)?;
        }
        Commands::SubmitBundle {
            tenant,
            run,
            file,
            accept_only,
        } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let bundle: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
            match pipeline.accept(tenant, run, &bundle, accept_only).await {
                Ok(result) => print_json(&result)?,
                Err(rip_pipeline::PipelineError::Validation(report)) => {
                    for issue in &report.errors {
                        eprintln!("{}: {}", issue.loc, issue.msg);
                    }
                    anyhow::bail!("bundle rejected with {} error(s)", report.errors.len());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Approve { tenant, run } => {
            print_json(&pipeline.approve(tenant, run).await?)?;
        }
        Commands::AddSources { tenant, run, urls } => {
            print_json(&pipeline.add_url_sources(tenant, run, &urls).await?)?;
        }
        Commands::Resolve { tenant, run } => {
            let job_id = pipeline.request_resolve(tenant, run).await?;
            println!("resolve queued: run_id={run} job_id={job_id}");
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Drops the password from a connection string before it is logged.
fn redact(database_url: &str) -> String {
    match (database_url.find("://"), database_url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &database_url[scheme_end + 3..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", &database_url[..scheme_end], user, &database_url[at + 1..])
        }
        _ => database_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_the_password() {
        assert_eq!(redact("postgres://rip:secret@db:5432/rip"), "postgres://rip:***@db:5432/rip");
        assert_eq!(redact("postgres://localhost/rip"), "postgres://localhost/rip");
    }

    #[test]
    fn parses_submit_bundle() {
        let tenant = Uuid::new_v4();
        let run = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "rip",
            "submit-bundle",
            "--tenant",
            &tenant.to_string(),
            "--run",
            &run.to_string(),
            "bundle.json",
            "--accept-only",
        ])
        .unwrap();
        match cli.command {
            Commands::SubmitBundle {
                tenant: t,
                run: r,
                file,
                accept_only,
            } => {
                assert_eq!((t, r), (tenant, run));
                assert_eq!(file, PathBuf::from("bundle.json"));
                assert!(accept_only);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
