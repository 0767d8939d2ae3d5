//! detections - print the zone count log as JSON

use anyhow::Result;
use clap::Parser;
use coopcam::{DetectionStore, SqliteDetectionStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection database.
    #[arg(long, env = "COOPCAM_DB_PATH", default_value = "db/detections.db")]
    db_path: String,
    /// Maximum number of records, newest first.
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Only show records for this zone.
    #[arg(long)]
    zone: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut store = SqliteDetectionStore::open(&args.db_path)?;
    let records: Vec<_> = match &args.zone {
        Some(zone) => store
            .list_detections(None)?
            .into_iter()
            .filter(|r| r.location.eq_ignore_ascii_case(zone))
            .take(args.limit)
            .collect(),
        None => store.list_detections(Some(args.limit))?,
    };

    let out = serde_json::json!({ "detections": records, "count": records.len() });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
