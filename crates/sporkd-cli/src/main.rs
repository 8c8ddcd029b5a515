use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use sporkd_core::{exception_list, is_open_at, resolve, status_label, weekly_view};
use sporkd_storage::ScheduleStore;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sporkd-hours")]
#[command(about = "Spork'd operating-hours toolbox")]
struct Cli {
    /// Schedule snapshot JSON file.
    #[arg(long, global = true, default_value = "schedules.json")]
    snapshot: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open/closed status for one vendor, now or at a given instant.
    Status {
        #[arg(long)]
        vendor: Uuid,
        /// RFC 3339 instant; defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Recurring weekly hours plus dated exceptions.
    Week {
        #[arg(long)]
        vendor: Uuid,
    },
    /// Evaluate the "open on day X at time Y" search predicate.
    Check {
        #[arg(long)]
        vendor: Uuid,
        /// Weekday, 0 = Monday ... 6 = Sunday.
        #[arg(long)]
        day: u8,
        /// Local wall-clock time, HH:MM.
        #[arg(long)]
        time: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = ScheduleStore::load_snapshot(&cli.snapshot)
        .await
        .with_context(|| format!("loading snapshot {}", cli.snapshot.display()))?;

    match cli.command {
        Commands::Status { vendor, at } => {
            let schedule = store.get(vendor)?;
            let at = at.unwrap_or_else(Utc::now);
            let status = resolve(&schedule, at);
            println!("{}", status_label(&schedule, at));
            if let Some(boundary) = status.current_boundary {
                println!(
                    "state changes at {}",
                    boundary.with_timezone(&schedule.timezone).format("%Y-%m-%d %H:%M %Z")
                );
            }
        }
        Commands::Week { vendor } => {
            let schedule = store.get(vendor)?;
            println!("timezone: {}", schedule.timezone);
            for day in weekly_view(&schedule) {
                if day.is_closed {
                    println!("{:<9} Closed", day.day);
                } else {
                    let spans: Vec<String> = day
                        .intervals
                        .iter()
                        .map(|iv| format!("{} - {}", iv.start_12h, iv.end_12h))
                        .collect();
                    println!("{:<9} {}", day.day, spans.join(", "));
                }
            }
            let exceptions = exception_list(&schedule);
            if !exceptions.is_empty() {
                println!();
                println!("exceptions:");
                for exc in exceptions {
                    let detail = if exc.is_closed {
                        "closed".to_string()
                    } else {
                        match (exc.start_local, exc.end_local) {
                            (Some(start), Some(end)) => {
                                format!("{} - {}", start.format("%H:%M"), end.format("%H:%M"))
                            }
                            _ => "closed".to_string(),
                        }
                    };
                    match &exc.note {
                        Some(note) => println!("  {} {} ({})", exc.date, detail, note),
                        None => println!("  {} {}", exc.date, detail),
                    }
                }
            }
        }
        Commands::Check { vendor, day, time } => {
            let schedule = store.get(vendor)?;
            let time = NaiveTime::parse_from_str(&time, "%H:%M")
                .context("time must be HH:MM, e.g. 21:00")?;
            let open = is_open_at(&schedule, day, time)?;
            println!("{}", if open { "open" } else { "closed" });
        }
    }

    Ok(())
}
