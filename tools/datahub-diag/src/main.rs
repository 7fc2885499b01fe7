// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! datahub-diag - Inspect DataHub shared memory segments
//!
//! Attaches to a named segment read-only (via `Segment::attach`'s schema
//! and secret checks bypassed through a raw observer path is not
//! available; this tool attaches the same way any consumer would, using
//! the secret and schema hashes supplied on the command line) and prints
//! the identity block, consumer-liveness table, and per-slot state.

use clap::Parser;
use colored::*;
use datahub::recovery::{self, SegmentSnapshot};
use datahub::segment::Segment;
use std::process::ExitCode;

/// Inspect a DataHub shared memory segment
#[derive(Parser, Debug)]
#[command(name = "datahub-diag")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect a DataHub shared memory segment")]
struct Args {
    /// Segment name, e.g. /my_channel
    segment: String,

    /// Shared secret, as 32 hex bytes (defaults to all-zero)
    #[arg(long)]
    secret_hex: Option<String>,

    /// Expected slot schema hash
    #[arg(long, default_value_t = 0)]
    slot_schema_hash: u64,

    /// Expected flex-zone schema hash
    #[arg(long, default_value_t = 0)]
    flex_zone_schema_hash: u64,

    /// Run an integrity pass and report any faults
    #[arg(short = 'i', long)]
    integrity: bool,

    /// Repair any integrity faults found (implies --integrity)
    #[arg(long)]
    repair: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown format: {s}")),
        }
    }
}

fn parse_secret(hex: Option<&str>) -> Result<[u8; 32], String> {
    let Some(hex) = hex else {
        return Ok([0u8; 32]);
    };
    let bytes = hex.as_bytes();
    if bytes.len() != 64 {
        return Err(format!("--secret-hex must be exactly 64 hex characters, got {}", bytes.len()));
    }
    let mut secret = [0u8; 32];
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| "invalid hex".to_string())?;
        secret[i] = u8::from_str_radix(s, 16).map_err(|_| format!("invalid hex byte: {s}"))?;
    }
    Ok(secret)
}

fn main() -> ExitCode {
    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> ExitCode {
    let secret = match parse_secret(args.secret_hex.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return ExitCode::from(4);
        }
    };

    let segment = match Segment::attach(
        &args.segment,
        &secret,
        args.slot_schema_hash,
        args.flex_zone_schema_hash,
    ) {
        Ok(segment) => segment,
        Err(datahub::DataHubError::NotFound(_)) => {
            eprintln!("{}: segment {:?} not found", "Error".red().bold(), args.segment);
            return ExitCode::from(2);
        }
        Err(datahub::DataHubError::LayoutMismatch { expected, found }) => {
            eprintln!(
                "{}: layout hash mismatch: expected {expected:#018x}, found {found:#018x}",
                "Error".red().bold()
            );
            return ExitCode::from(5);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return ExitCode::from(4);
        }
    };

    let snap = recovery::snapshot(&segment);

    let mut exit = ExitCode::SUCCESS;
    let integrity = if args.integrity || args.repair {
        let report = recovery::validate_integrity(&segment, args.repair);
        if !report.is_clean() {
            exit = ExitCode::from(3);
        }
        Some(report)
    } else {
        None
    };

    match args.format {
        OutputFormat::Pretty => print_pretty(&args.segment, &snap, integrity.as_ref()),
        OutputFormat::Json => print_json(&args.segment, &snap, integrity.as_ref()),
    }

    exit
}

fn print_pretty(
    name: &str,
    snap: &SegmentSnapshot,
    integrity: Option<&recovery::IntegrityReport>,
) {
    println!();
    println!("{}", format!("=== {name} ===").bold());
    println!();

    println!(
        "  {} pid={} alive={} heartbeat_ns={}",
        "producer".cyan(),
        snap.producer.pid,
        badge(snap.producer.alive),
        snap.producer.heartbeat_ns
    );
    println!("  write_index={} read_index={}", snap.write_index, snap.read_index);
    println!();

    println!("{}", "--- Metrics ---".dimmed());
    println!(
        "  writes_total={} reads_total={} reader_peak={}",
        snap.metrics.writes_total, snap.metrics.reads_total, snap.metrics.reader_peak
    );
    println!(
        "  timeouts_by_cause: ring_full={} drain={}  checksum_errors={}",
        snap.metrics.timeouts_ring_full, snap.metrics.timeouts_drain, snap.metrics.checksum_errors
    );
    println!();

    println!("{}", "--- Consumers ---".dimmed());
    if snap.consumers.is_empty() {
        println!("  (none claimed)");
    }
    for consumer in &snap.consumers {
        println!(
            "  [{}] pid={} alive={} pending_slot_id={} uid={:?} name={:?}",
            consumer.row,
            consumer.pid,
            badge(consumer.alive),
            consumer.pending_slot_id,
            String::from_utf8_lossy(&consumer.consumer_uid),
            String::from_utf8_lossy(&consumer.consumer_name),
        );
    }
    println!();

    println!("{}", "--- Slots ---".dimmed());
    for slot in &snap.slots {
        println!(
            "  [{:>4}] state={:?} slot_id={} reader_count={} owner_pid={}",
            slot.index, slot.state, slot.slot_id, slot.reader_count, slot.owner_pid
        );
    }

    if let Some(report) = integrity {
        println!();
        println!("{}", "--- Integrity ---".dimmed());
        if report.is_clean() {
            println!("  {}", "no faults found".green());
        } else {
            for fault in &report.faults {
                println!("  {} {:?}", "FAULT".red().bold(), fault);
            }
            if !report.repaired.is_empty() {
                println!("  repaired {} fault(s)", report.repaired.len());
            }
        }
    }
    println!();
}

fn badge(alive: bool) -> ColoredString {
    if alive {
        "yes".green()
    } else {
        "no".red()
    }
}

fn print_json(name: &str, snap: &SegmentSnapshot, integrity: Option<&recovery::IntegrityReport>) {
    print!(
        "{{\"segment\":\"{name}\",\"write_index\":{},\"read_index\":{},",
        snap.write_index, snap.read_index
    );
    print!(
        "\"producer\":{{\"pid\":{},\"alive\":{},\"heartbeat_ns\":{}}},",
        snap.producer.pid, snap.producer.alive, snap.producer.heartbeat_ns
    );
    print!(
        "\"metrics\":{{\"writes_total\":{},\"reads_total\":{},\"reader_peak\":{},\"timeouts_ring_full\":{},\"timeouts_drain\":{},\"checksum_errors\":{}}},",
        snap.metrics.writes_total,
        snap.metrics.reads_total,
        snap.metrics.reader_peak,
        snap.metrics.timeouts_ring_full,
        snap.metrics.timeouts_drain,
        snap.metrics.checksum_errors
    );

    print!("\"consumers\":[");
    for (i, consumer) in snap.consumers.iter().enumerate() {
        if i > 0 {
            print!(",");
        }
        print!(
            "{{\"row\":{},\"pid\":{},\"alive\":{},\"pending_slot_id\":{}}}",
            consumer.row, consumer.pid, consumer.alive, consumer.pending_slot_id
        );
    }
    print!("],");

    print!("\"slots\":[");
    for (i, slot) in snap.slots.iter().enumerate() {
        if i > 0 {
            print!(",");
        }
        print!(
            "{{\"index\":{},\"state\":\"{:?}\",\"slot_id\":{},\"reader_count\":{},\"owner_pid\":{}}}",
            slot.index, slot.state, slot.slot_id, slot.reader_count, slot.owner_pid
        );
    }
    print!("]");

    if let Some(report) = integrity {
        print!(",\"integrity_clean\":{}", report.is_clean());
    }

    println!("}}");
}
