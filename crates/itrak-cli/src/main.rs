use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use itrak_queue::{RedisQueue, WorkQueue};
use itrak_store::{RecordFilter, Store};
use itrak_sync::{git_sources, run_worker, write_opportunity_csv, ChangeSource, MonitorConfig, ScanPipeline};

#[derive(Debug, Parser)]
#[command(name = "itrak-cli")]
#[command(about = "Internship posting tracker")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one monitor cycle: detect changes, extract postings, seed the
    /// company queue, and refresh the CSV report.
    Scan,
    /// Consume the company queue, printing each name for the people-search
    /// stage. Runs until interrupted.
    Worker {
        /// Handle at most one company, then exit.
        #[arg(long)]
        once: bool,
        /// Blocking dequeue timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Totals and the most active organizations.
    Summary,
    /// Postings discovered in the trailing N days.
    Recent {
        #[arg(short, long, default_value = "7")]
        days: i64,
    },
    /// Matched people, optionally filtered by organization.
    Alumni {
        #[arg(short = 'C', long)]
        company: Option<String>,
    },
    /// Write the combined postings/people CSV report.
    Export,
    /// Manually queue company names for people search.
    Enqueue {
        #[arg(required = true)]
        companies: Vec<String>,
    },
    /// Current queue depth.
    QueueStats,
    /// Drop all queued companies and the dedup set.
    QueueClear,
}

fn open_queue(config: &MonitorConfig) -> Result<RedisQueue> {
    Ok(RedisQueue::connect(
        &config.redis_url,
        &config.queue_key,
        &config.seen_set_key,
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan => {
            let store = Store::open(&config.database_path)?;
            let queue = open_queue(&config)?;
            let sources = git_sources(&config);
            let source_refs: Vec<&dyn ChangeSource> =
                sources.iter().map(|s| s as &dyn ChangeSource).collect();

            let pipeline = ScanPipeline::new(&store, &queue, &config);
            let summary = pipeline.run(&source_refs)?;
            for scan in &summary.scans {
                match &scan.error {
                    Some(error) => println!("{}: FAILED ({error})", scan.source_id),
                    None => println!(
                        "{}: {} changes inspected, {} new postings",
                        scan.source_id, scan.changes_inspected, scan.new_postings
                    ),
                }
            }
            println!(
                "scan complete: {} new postings, {} companies queued, {} sources failed",
                summary.new_postings(),
                summary.companies_enqueued,
                summary.failed_sources()
            );

            write_opportunity_csv(&config.output_csv, &store.opportunity_rows()?)?;
            println!("report written to {}", config.output_csv.display());
        }
        Commands::Worker { once, timeout } => {
            let queue = open_queue(&config)?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.dequeue_timeout());

            if once {
                match queue.dequeue(true, timeout)? {
                    Some(company) => println!("{company}"),
                    None => println!("queue empty"),
                }
            } else {
                let shutdown = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    flag.store(true, Ordering::SeqCst);
                });

                let handled = tokio::task::spawn_blocking(move || {
                    run_worker(&queue, timeout, &shutdown, |company| {
                        println!("{company}");
                        Ok(())
                    })
                })
                .await??;
                println!("worker stopped after {handled} companies");
            }
        }
        Commands::Summary => {
            let store = Store::open(&config.database_path)?;
            let counts = store.counts()?;
            println!(
                "{} postings ({} in the last week), {} people ({} in the last week)",
                counts.postings, counts.postings_last_week, counts.people, counts.people_last_week
            );
            for (organization, n) in store.postings_by_organization(10)? {
                println!("  {organization}: {n}");
            }
        }
        Commands::Recent { days } => {
            let store = Store::open(&config.database_path)?;
            let filter = RecordFilter {
                days: Some(days),
                ..RecordFilter::default()
            };
            for posting in store.postings(&filter)? {
                println!(
                    "{}  {} | {} | {} | {}",
                    posting.discovered_at.format("%Y-%m-%d"),
                    posting.organization,
                    posting.role,
                    posting.location,
                    posting.application_link
                );
            }
        }
        Commands::Alumni { company } => {
            let store = Store::open(&config.database_path)?;
            let filter = RecordFilter {
                organization: company,
                ..RecordFilter::default()
            };
            for person in store.people(&filter)? {
                println!(
                    "{} | {} | {} | {}",
                    person.name, person.organization, person.headline, person.profile_url
                );
            }
        }
        Commands::Export => {
            let store = Store::open(&config.database_path)?;
            let rows = store.opportunity_rows()?;
            write_opportunity_csv(&config.output_csv, &rows)?;
            println!("wrote {} rows to {}", rows.len(), config.output_csv.display());
        }
        Commands::Enqueue { companies } => {
            let queue = open_queue(&config)?;
            for company in &companies {
                if queue.enqueue(company)? {
                    println!("queued {company}");
                } else {
                    println!("skipped {company} (already seen)");
                }
            }
        }
        Commands::QueueStats => {
            let queue = open_queue(&config)?;
            println!("{} companies queued", queue.len()?);
        }
        Commands::QueueClear => {
            let queue = open_queue(&config)?;
            queue.clear()?;
            println!("queue cleared");
        }
    }

    Ok(())
}
