// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! labhub-shm-viewer - inspect and repair labhub channels
//!
//! Lists channel segments under /dev/shm, decodes headers through the
//! diagnostic view (gated by `LABHUB_ADMIN_TOKEN`), runs integrity scans,
//! and drives force-reset / zombie release.

use clap::Parser;
use colored::*;
use labhub::recovery::{self, DiagnosticView};
use std::path::Path;

/// Inspect labhub shared memory channels
#[derive(Parser, Debug)]
#[command(name = "labhub-shm-viewer")]
#[command(version)]
#[command(about = "Inspect and repair labhub shared memory channels")]
struct Args {
    /// Channel to inspect (without the labhub_ prefix)
    #[arg()]
    channel: Option<String>,

    /// Show per-slot state
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Run an integrity scan on the channel
    #[arg(long)]
    integrity: bool,

    /// Force-reset the channel (clears readers, aborts writes)
    #[arg(long)]
    force_reset: bool,

    /// Release zombie writer and readers on the channel
    #[arg(long)]
    release_zombies: bool,

    /// Unlink all segments whose producer is dead
    #[arg(long)]
    cleanup: bool,
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
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.cleanup {
        let cleaned = recovery::cleanup_stale_channels();
        println!("Cleaned up {} stale segment(s)", cleaned);
        return Ok(());
    }

    let Some(channel) = args.channel.as_deref() else {
        return list_segments(args);
    };

    if args.force_reset {
        let outcome = recovery::force_reset(channel)?;
        println!(
            "{} force reset: {} write(s) aborted, {} reader count(s) cleared, {} heartbeat(s) freed",
            channel.bold(),
            outcome.aborted_writes,
            outcome.cleared_readers,
            outcome.cleared_heartbeats
        );
        return Ok(());
    }

    if args.release_zombies {
        let writer = recovery::release_zombie_writer(channel)?;
        let readers = recovery::release_zombie_readers(channel)?;
        println!(
            "{}: zombie writer released: {}, zombie reader counts dropped: {}",
            channel.bold(),
            writer,
            readers
        );
        return Ok(());
    }

    if args.integrity {
        let report = recovery::validate_integrity(channel)?;
        print_integrity(channel, &report, &args.format);
        return Ok(());
    }

    let view = open_view(channel)?;
    match args.format {
        OutputFormat::Pretty => print_pretty(&view, args.verbose),
        OutputFormat::Json => print_json(&view, args.verbose),
    }
    Ok(())
}

fn open_view(channel: &str) -> Result<DiagnosticView, Box<dyn std::error::Error>> {
    let Some(token) = recovery::deployment_admin_token() else {
        return Err(format!(
            "{} is not set; header inspection needs the deployment admin token",
            recovery::ADMIN_TOKEN_ENV
        )
        .into());
    };
    Ok(recovery::open_for_diagnostic(channel, &token)?)
}

fn list_segments(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let shm_dir = Path::new("/dev/shm");
    if !shm_dir.exists() {
        return Err("Shared memory directory /dev/shm not found".into());
    }

    let mut rows = Vec::new();
    for entry in std::fs::read_dir(shm_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(channel) = name.strip_prefix("labhub_") {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            rows.push((channel.to_string(), size));
        }
    }
    rows.sort();

    match args.format {
        OutputFormat::Json => {
            println!("[");
            for (i, (channel, size)) in rows.iter().enumerate() {
                let comma = if i + 1 < rows.len() { "," } else { "" };
                println!(r#"  {{"channel":"{channel}","size":{size}}}{comma}"#);
            }
            println!("]");
        }
        OutputFormat::Pretty => {
            if rows.is_empty() {
                println!("No labhub segments found");
                return Ok(());
            }
            println!("{}", "CHANNEL                          SIZE".bold());
            for (channel, size) in rows {
                println!("{channel:<32} {size}");
            }
        }
    }
    Ok(())
}

fn print_pretty(view: &DiagnosticView, verbose: bool) {
    let (slot_count, slot_size, flex_size) = view.geometry();
    let metrics = view.metrics();
    let (producer_pid, producer_age) = view.producer_heartbeat();
    let (major, minor) = view.version();

    println!("{} {}", "Channel".bold(), view.channel().cyan());
    println!("  version        {major}.{minor}");
    println!("  slots          {slot_count} x {slot_size} B");
    println!("  flexible zone  {flex_size} B");
    println!("  generation     {}", metrics.generation);
    println!("  write index    {}", metrics.write_index);
    println!("  read hint      {}", metrics.read_index_hint);
    println!(
        "  producer       pid {} ({})",
        producer_pid,
        format_age(producer_pid, producer_age)
    );

    println!("{}", "Metrics".bold());
    println!("  writes             {}", metrics.writes);
    println!("  overruns           {}", colour_count(metrics.overruns));
    println!("  acquire failures   {}", colour_count(metrics.acquire_failures));
    println!("  integrity failures {}", colour_count(metrics.integrity_failures));

    let consumers = view.consumer_heartbeats();
    println!("{} ({})", "Consumers".bold(), consumers.len());
    for (index, pid, age_ns) in consumers {
        println!(
            "  [{index}] pid {pid} (heartbeat {:.1} ms ago)",
            age_ns as f64 / 1e6
        );
    }

    if verbose {
        println!("{}", "Slots".bold());
        for phys in 0..slot_count {
            let s = view.slot_state(phys);
            let status = if s.sequence == 0 {
                "empty".dimmed()
            } else if s.sequence % 2 == 1 {
                "writing".yellow()
            } else if s.flags & 1 != 0 {
                "corrupt".red()
            } else {
                "committed".green()
            };
            println!(
                "  [{phys}] seq {} id {} readers {} {}",
                s.sequence, s.slot_id, s.readers, status
            );
        }
    }
}

fn print_json(view: &DiagnosticView, verbose: bool) {
    let (slot_count, slot_size, flex_size) = view.geometry();
    let metrics = view.metrics();
    let (major, minor) = view.version();
    let (producer_pid, producer_age) = view.producer_heartbeat();

    println!("{{");
    println!(r#"  "channel":"{}","#, view.channel());
    println!(r#"  "version":"{major}.{minor}","#);
    println!(r#"  "slot_count":{slot_count},"#);
    println!(r#"  "slot_size":{slot_size},"#);
    println!(r#"  "flexible_zone_size":{flex_size},"#);
    println!(r#"  "generation":{},"#, metrics.generation);
    println!(r#"  "write_index":{},"#, metrics.write_index);
    println!(r#"  "writes":{},"#, metrics.writes);
    println!(r#"  "overruns":{},"#, metrics.overruns);
    println!(r#"  "acquire_failures":{},"#, metrics.acquire_failures);
    println!(r#"  "integrity_failures":{},"#, metrics.integrity_failures);
    println!(r#"  "producer_pid":{producer_pid},"#);
    println!(r#"  "producer_heartbeat_age_ns":{producer_age},"#);

    let consumers = view.consumer_heartbeats();
    let entries: Vec<String> = consumers
        .iter()
        .map(|(index, pid, age)| {
            format!(r#"{{"index":{index},"pid":{pid},"heartbeat_age_ns":{age}}}"#)
        })
        .collect();
    if verbose {
        println!(r#"  "consumers":[{}],"#, entries.join(","));
        let slots: Vec<String> = (0..slot_count)
            .map(|phys| {
                let s = view.slot_state(phys);
                format!(
                    r#"{{"slot":{phys},"sequence":{},"slot_id":{},"readers":{},"flags":{}}}"#,
                    s.sequence, s.slot_id, s.readers, s.flags
                )
            })
            .collect();
        println!(r#"  "slots":[{}]"#, slots.join(","));
    } else {
        println!(r#"  "consumers":[{}]"#, entries.join(","));
    }
    println!("}}");
}

fn print_integrity(channel: &str, report: &labhub::IntegrityReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            let mismatches: Vec<String> = report
                .checksum_mismatches
                .iter()
                .map(u64::to_string)
                .collect();
            let readers: Vec<String> =
                report.stale_reader_pids.iter().map(u64::to_string).collect();
            println!("{{");
            println!(r#"  "channel":"{channel}","#);
            println!(r#"  "clean":{},"#, report.is_clean());
            println!(r#"  "checksum_mismatches":[{}],"#, mismatches.join(","));
            println!(
                r#"  "stale_writer_pid":{},"#,
                report
                    .stale_writer_pid
                    .map_or("null".to_string(), |p| p.to_string())
            );
            println!(r#"  "stale_reader_pids":[{}],"#, readers.join(","));
            println!(r#"  "flexzone_mismatch":{}"#, report.flexzone_mismatch);
            println!("}}");
        }
        OutputFormat::Pretty => {
            if report.is_clean() {
                println!("{} {}", channel.bold(), "clean".green());
                return;
            }
            println!("{} {}", channel.bold(), "DAMAGED".red().bold());
            if !report.checksum_mismatches.is_empty() {
                println!("  checksum mismatches: {:?}", report.checksum_mismatches);
            }
            if let Some(pid) = report.stale_writer_pid {
                println!("  stale writer pid: {pid}");
            }
            if !report.stale_reader_pids.is_empty() {
                println!("  stale reader pids: {:?}", report.stale_reader_pids);
            }
            if report.flexzone_mismatch {
                println!("  flexible zone checksum mismatch");
            }
        }
    }
}

fn format_age(pid: u64, age_ns: u64) -> String {
    if pid == 0 {
        "absent".to_string()
    } else {
        format!("heartbeat {:.1} ms ago", age_ns as f64 / 1e6)
    }
}

fn colour_count(n: u64) -> ColoredString {
    if n == 0 {
        n.to_string().normal()
    } else {
        n.to_string().yellow()
    }
}
