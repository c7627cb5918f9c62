use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod error;
mod forecast;
mod models;
mod report;
mod service;
mod similarity;
mod statistics;
mod store;

use config::AppConfig;
use models::{Outlook, Prediction};
use service::ForecastService;
use store::RecordStore;

#[derive(Parser)]
#[command(name = "cohort-gpa-forecast")]
#[command(about = "Cumulative average forecasts and cohort standings", long_about = None)]
struct Cli {
    /// JSON file overriding forecast and statistics settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Serve queries from a CSV export instead of Postgres
    #[arg(long, global = true)]
    offline_csv: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample cohorts
    Seed,
    /// Import term results from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List known cohorts
    Cohorts,
    /// Forecast a student's cumulative average toward a target
    Predict {
        #[arg(long)]
        student: String,
        #[arg(long)]
        target: f64,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
        /// Write a markdown report
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Cohort distribution, difficulty and standing
    Stats {
        #[arg(long)]
        cohort: String,
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_prediction(prediction: &Prediction) {
    println!(
        "{}: cumulative {:.2} after term {}, target {:.2}",
        prediction.student_id,
        prediction.current_cumulative_average,
        prediction.current_term,
        prediction.target_cumulative_average
    );

    let outlook = &prediction.outlook;
    match outlook {
        Outlook::TargetAlreadyMet { .. } => println!("Target already met."),
        Outlook::Projected(projection) => {
            println!("{}", projection.verdict);
            println!(
                "Best case {:.2}, worst case {:.2}",
                projection.best_case, projection.worst_case
            );
        }
    }
    println!(
        "Predicted {:.2}, confidence {:.2}%",
        outlook.predicted_cumulative_average(),
        outlook.confidence() * 100.0
    );
    if let Outlook::Projected(projection) = outlook {
        for (term, average) in &projection.per_term_projections {
            println!("- term {term}: projected period average {average:.2}");
        }
    }

    if let Some(standing) = &prediction.program_standing {
        println!(
            "Program standing: rank {} of {} ({:.2} percentile)",
            standing.rank, standing.cohort_size, standing.percentile
        );
    }
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Read-only commands, served by any record store.
async fn run_query<S: RecordStore>(service: ForecastService<S>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Cohorts => {
            let cohorts = service.cohorts().await?;
            if cohorts.is_empty() {
                println!("No cohorts loaded.");
            }
            for cohort in cohorts {
                println!("- {cohort}");
            }
        }
        Commands::Predict {
            student,
            target,
            json,
            out,
        } => {
            let prediction = service
                .predict(&student, target)
                .await
                .with_context(|| format!("prediction for {student} failed"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&prediction)?);
            } else {
                print_prediction(&prediction);
            }
            if let Some(out) = out {
                std::fs::write(&out, report::build_prediction_report(&prediction, Utc::now()))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::Stats {
            cohort,
            student,
            json,
            out,
        } => {
            let statistics = service
                .class_statistics(&cohort, student.as_deref())
                .await
                .with_context(|| format!("statistics for cohort {cohort} failed"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&statistics)?);
            } else {
                let whole = &statistics.cohort_wide;
                println!(
                    "Cohort {}: {} students, class average {:.2}, highest {:.2}",
                    statistics.cohort,
                    whole.population_size,
                    whole.class_average_final_cumulative,
                    whole.highest_final
                );
                if let Some(standing) = &whole.standing {
                    println!(
                        "Cohort standing: rank {} of {} ({:.2} percentile)",
                        standing.rank, standing.cohort_size, standing.percentile
                    );
                }
                if let Some(program) = &statistics.program {
                    if let Some(standing) = &program.aggregate.standing {
                        println!(
                            "Program {} standing: rank {} of {} ({:.2} percentile)",
                            program.program_prefix,
                            standing.rank,
                            standing.cohort_size,
                            standing.percentile
                        );
                    }
                }
                for entry in &whole.difficulty_by_term {
                    println!(
                        "- term {}: {} ({:.2})",
                        entry.term,
                        entry.difficulty.label(),
                        entry.avg_period_average
                    );
                }
            }
            if let Some(out) = out {
                std::fs::write(&out, report::build_statistics_report(&statistics, Utc::now()))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::InitDb | Commands::Seed | Commands::Import { .. } => {
            anyhow::bail!("this command needs a Postgres connection")
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::InitDb => {
            db::init_db(&connect().await?).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let summary = db::seed(&connect().await?).await?;
            println!(
                "Seeded {} students ({} term rows) as import {}.",
                summary.students, summary.rows, summary.import_id
            );
        }
        Commands::Import { csv } => {
            let summary = db::import_csv(&connect().await?, &csv).await?;
            println!(
                "Imported {} term rows for {} students from {} (import {} at {}).",
                summary.rows,
                summary.students,
                csv.display(),
                summary.import_id,
                summary.imported_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        command => match &cli.offline_csv {
            Some(path) => {
                let store = db::load_offline(path)?;
                run_query(ForecastService::new(store, config), command).await?;
            }
            None => {
                let store = db::PgRecordStore::new(connect().await?);
                run_query(ForecastService::new(store, config), command).await?;
            }
        },
    }

    Ok(())
}
