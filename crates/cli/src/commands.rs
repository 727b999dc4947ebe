use chrono::{DateTime, Utc};
use clap::Subcommand;
use model::core::time::parse_instant;

#[derive(Subcommand)]
pub enum Commands {
    /// Create the journal schema when it is missing
    Ensure,
    /// Show the process state and its latest journal records
    Status {
        #[arg(long, help = "Print as JSON instead of a table")]
        json: bool,

        #[arg(long, default_value_t = 10, help = "Number of records to show")]
        limit: usize,
    },
    /// Close abandoned planned and running records
    Sanitize,
    /// Drop journal buckets past the retention horizon
    Prune {
        #[arg(long, help = "Prune even if the last prune is recent")]
        force: bool,
    },
    /// Demote every active record for a window except one
    Resolve {
        #[arg(long, value_parser = parse_time, help = "Window start")]
        from: DateTime<Utc>,

        #[arg(long, value_parser = parse_time, help = "Window end")]
        to: DateTime<Utc>,

        #[arg(long, help = "Record id to leave active")]
        keep: Option<i64>,
    },
    /// Deduplicate and publish the raw partitions of a time range
    Publish {
        #[arg(long, value_parser = parse_time)]
        since: DateTime<Utc>,

        #[arg(long, value_parser = parse_time)]
        until: DateTime<Utc>,

        #[arg(
            long,
            help = "Publish every day covering the range without looking for raw rows"
        )]
        no_backfill: bool,
    },
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(text).map_err(|e| e.to_string())
}
