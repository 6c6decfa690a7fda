//! # Seed Data Generator
//!
//! Populates a local store with sample notes and todos for development.
//! Every record is written as a local change, so the seeded database also
//! has a full outbound queue to exercise the sync orchestrator against.
//!
//! ## Usage
//! ```bash
//! # Generate 200 records (default)
//! cargo run -p keel-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p keel-db --bin seed -- --count 1000
//!
//! # Specify database path
//! cargo run -p keel-db --bin seed -- --db ./data/keel.db
//! ```

use keel_core::{Initiator, ModelSchema, Record, SchemaRegistry};
use keel_db::{DbConfig, LocalStore};
use serde_json::json;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOPICS: &[&str] = &[
    "groceries",
    "standup",
    "reading list",
    "travel",
    "garden",
    "budget",
    "recipes",
    "workout",
];

fn sample_record(index: usize) -> Record {
    let topic = TOPICS[index % TOPICS.len()];
    if index % 3 == 0 {
        Record::new(
            "Todo",
            format!("todo-{index:05}"),
            json!({
                "title": format!("Follow up on {topic}"),
                "done": index % 2 == 0,
                "priority": (index % 5) as i64 + 1,
            }),
        )
    } else {
        Record::new(
            "Note",
            format!("note-{index:05}"),
            json!({
                "title": format!("{topic} #{index}"),
                "body": format!("Notes about {topic}."),
                "rating": (index % 5) as i64,
                "tags": [topic],
            }),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./keel_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Keel Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of records to generate (default: 200)");
                println!("  -d, --db <PATH>    Database file path (default: ./keel_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, count, "Seeding local store");

    let schemas = SchemaRegistry::from_schemas([ModelSchema::new("Note"), ModelSchema::new("Todo")])?;
    let store = LocalStore::new(DbConfig::new(&db_path));
    store.initialize(&schemas).await?;

    let existing = store.query("Note", None).await?.len() + store.query("Todo", None).await?.len();
    if existing > 0 {
        warn!(existing, "Store already has records; skipping seed. Delete the file to regenerate.");
        store.terminate().await;
        return Ok(());
    }

    let start = std::time::Instant::now();
    let mut generated = 0;

    for index in 0..count {
        let record = sample_record(index);
        if let Err(e) = store.save(record, Initiator::Local, None).await {
            warn!(index, error = %e, "Failed to insert record");
            continue;
        }
        generated += 1;

        if generated % 100 == 0 {
            info!(generated, "Progress");
        }
    }

    let elapsed = start.elapsed();
    info!(
        generated,
        elapsed_ms = elapsed.as_millis() as u64,
        pending = store.pending_count().await?,
        "Seed complete"
    );

    store.terminate().await;
    Ok(())
}
