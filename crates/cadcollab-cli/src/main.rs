//! # cadcollab CLI
//!
//! Operator utilities for inspecting deployments.

use anyhow::{Context, Result};
use cadcollab_adapter_http::{decode_path_segment, encode_path_segment};
use cadcollab_agent::SqliteStore;
use cadcollab_proto::TopicScheme;
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "topic" => {
            if args.len() < 4 {
                eprintln!("Usage: cadcollab topic <tenant> <project_id>");
                std::process::exit(1);
            }
            println!("{}", TopicScheme::new(args[2].as_str()).events(&args[3]));
        }
        "encode" => {
            if args.len() < 3 {
                eprintln!("Usage: cadcollab encode <project_id>");
                std::process::exit(1);
            }
            println!("{}", encode_path_segment(&args[2]));
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: cadcollab decode <encoded>");
                std::process::exit(1);
            }
            let decoded = decode_path_segment(&args[2]).context("Failed to decode")?;
            println!("{decoded}");
        }
        "sessions" => {
            if args.len() < 3 {
                eprintln!("Usage: cadcollab sessions <db_path>");
                std::process::exit(1);
            }
            let store = open(&args[2])?;
            for summary in store.list_sessions().context("Failed to list sessions")? {
                println!(
                    "{}\t{}\trevision={}\toperations={}\tsaved={}",
                    summary.project_id,
                    summary.session_id,
                    summary.revision,
                    summary.operation_count,
                    summary.saved_at.to_rfc3339()
                );
            }
        }
        "snapshot" => {
            if args.len() < 4 {
                eprintln!("Usage: cadcollab snapshot <db_path> <project_id>");
                std::process::exit(1);
            }
            let store = open(&args[2])?;
            let state = store
                .load_session_state(&args[3])
                .context("Failed to load snapshot")?
                .with_context(|| format!("No snapshot stored for {}", args[3]))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn open(path: &str) -> Result<SqliteStore> {
    let path = Path::new(path);
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }
    SqliteStore::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn print_help() {
    println!(
        r#"cadcollab CLI

USAGE:
    cadcollab <COMMAND> [OPTIONS]

COMMANDS:
    topic <tenant> <project>     Print the fan-out topic of a project
    encode <project>             Percent-encode a project id for backend URLs
    decode <encoded>             Decode a percent-encoded project id
    sessions <db>                List persisted sessions in a SQLite database
    snapshot <db> <project>      Print the persisted session state of a project
    help                         Show this help message

EXAMPLES:
    cadcollab topic acme bridge/7
    cadcollab snapshot ./cadcollab.db bridge/7
"#
    );
}
