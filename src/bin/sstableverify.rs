//! Standalone sstable verifier.
//!
//! Walks the table directory under the data directory (environment variable
//! `EMBERDB_DATA_DIR`, default `./data`), verifies every complete sstable
//! and reflects the outcome in the exit code: 0 when everything verified,
//! 1 on any failure or setup error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use emberdb::dht::{Range, Token};
use emberdb::verify::{verify_table, VerifyOptions};

#[derive(Parser, Debug)]
#[command(
    name = "sstableverify",
    about = "Verify the sstables for the provided table",
    arg_required_else_help = true
)]
struct Args {
    keyspace: String,
    table: String,

    /// verbose output
    #[arg(short, long)]
    verbose: bool,

    /// extended verification: re-read every component in full
    #[arg(short, long)]
    extended: bool,

    /// display stack traces on failure
    #[arg(long)]
    debug: bool,

    /// make sure sstables are the latest version
    #[arg(short = 'c', long = "check_version")]
    check_version: bool,

    /// permit writing a new repair status on verified sstables
    #[arg(short = 'r', long = "mutate_repair_status")]
    mutate_repair_status: bool,

    /// do a quick check, don't read all data
    #[arg(short, long)]
    quick: bool,

    /// token range of the format left,right; may be provided multiple times
    #[arg(short = 't', long = "token_range", value_name = "left,right", value_parser = parse_token_range)]
    token_range: Vec<Range>,
}

fn parse_token_range(s: &str) -> Result<Range, String> {
    let (left, right) = s
        .split_once(',')
        .ok_or_else(|| format!("format is left,right but saw {s}"))?;
    let left: i64 = left
        .trim()
        .parse()
        .map_err(|e| format!("bad left token: {e}"))?;
    let right: i64 = right
        .trim()
        .parse()
        .map_err(|e| format!("bad right token: {e}"))?;
    Ok(Range::new(Token(left), Token(right)))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let data_dir = PathBuf::from(
        std::env::var("EMBERDB_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    );

    if args.verbose {
        println!("sstableverify using the following options: {args:?}");
    }

    let options = VerifyOptions {
        extended: args.extended,
        check_version: args.check_version,
        mutate_repair_status: args.mutate_repair_status,
        quick: args.quick,
        token_ranges: args.token_range.clone(),
    };

    match verify_table(&data_dir, &args.keyspace, &args.table, &options) {
        Ok(outcome) => {
            for (descriptor, error) in &outcome.failed {
                eprintln!("Error verifying {descriptor}: {error}");
                if args.debug {
                    eprintln!("{error:?}");
                }
            }
            if args.verbose {
                println!(
                    "{} sstables verified, {} failed",
                    outcome.verified,
                    outcome.failed.len()
                );
            }
            if outcome.all_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{e}");
            if args.debug {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
