use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use trawl::db::Database;
use trawl::models::JobState;

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Job scraping pipeline - discover postings, enrich them, share one store")]
struct Cli {
    /// Path to the shared store file (default: user data directory).
    /// Both worker processes must point at the same file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database (safe to re-run)
    Init,

    /// Show pending/scraped/errored totals
    Status,

    /// List jobs still awaiting enrichment
    Pending {
        /// Number of jobs to show
        #[arg(short, long, default_value = "25")]
        limit: usize,
    },

    /// Show one job's stored state
    Show {
        /// Job ID
        job_id: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let db = match &cli.db {
        Some(path) => Database::open_at(path)?,
        None => Database::open()?,
    };

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Status => {
            db.ensure_initialized()?;
            let counts = db.state_counts()?;
            println!("{:<10} {:>8}", "STATE", "JOBS");
            println!("{}", "-".repeat(19));
            println!("{:<10} {:>8}", "pending", counts.pending);
            println!("{:<10} {:>8}", "scraped", counts.scraped);
            println!("{:<10} {:>8}", "error", counts.errored);
        }

        Commands::Pending { limit } => {
            db.ensure_initialized()?;
            let jobs = db.list_pending(limit)?;
            if jobs.is_empty() {
                println!("No pending jobs.");
            } else {
                println!("{:<12} {:<40} {:<20}", "ID", "TITLE", "LOCATION");
                println!("{}", "-".repeat(74));
                for job in jobs {
                    println!(
                        "{:<12} {:<40} {:<20}",
                        job.job_id,
                        truncate(job.title.as_deref().unwrap_or("-"), 38),
                        truncate(job.location.as_deref().unwrap_or("-"), 18)
                    );
                }
            }
        }

        Commands::Show { job_id } => {
            db.ensure_initialized()?;
            match db.get_job(job_id)? {
                Some(job) => {
                    println!("Job #{}", job.job_id);
                    if let Some(title) = &job.title {
                        println!("Title: {}", title);
                    }
                    match job.state() {
                        JobState::Pending => println!("State: pending"),
                        JobState::Error => println!("State: error"),
                        JobState::Scraped(ts) => println!("State: scraped at {}", ts),
                    }
                    if let Some(company_id) = job.company_id {
                        println!("Company: #{}", company_id);
                    }
                    if let Some(location) = &job.location {
                        println!("Location: {}", location);
                    }
                    if job.sponsored == Some(1) {
                        println!("Sponsored: yes");
                    }
                }
                None => {
                    println!("Job #{} not found.", job_id);
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        // Cut on character boundaries; titles are not always ASCII.
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_strings_untouched() {
        assert_eq!(truncate("Engineer", 10), "Engineer");
    }

    #[test]
    fn test_truncate_handles_multibyte_titles() {
        let title = "Ingénieur développement logiciel sénior";
        let cut = truncate(title, 12);
        assert_eq!(cut, "Ingénieur...");
        // A boundary that falls inside a multibyte char must not panic.
        assert_eq!(truncate("éééééé", 5), "éé...");
    }
}
