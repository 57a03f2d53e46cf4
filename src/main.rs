use chrono::DateTime;
use clap::{Parser, Subcommand};
use nfdump::codec::CompressionId;
use nfdump::order::Direction;
use nfdump::record::FlowRecordV3;
use nfdump::{NfFile, ReadOptions};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "nfread", about = "Read nfdump flow files")]
struct Cli {
    /// Diagnostics on stderr: -v info, -vv debug
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Decompressed block size ceiling in KiB
    #[arg(long, default_value = "5120", global = true)]
    max_block_size: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show file header, identity and statistics
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print flow records, one per line
    Dump {
        input: PathBuf,
        /// Order by tstart, tend, packets or bytes
        #[arg(short, long)]
        order_by: Option<String>,
        /// Descending order
        #[arg(short, long)]
        desc: bool,
        /// Stop after this many records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// List exporters and their samplers
    Exporters {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct FileInfo<'a> {
    header: &'a nfdump::FileHeader,
    ident:  &'a str,
    stats:  &'a nfdump::StatRecord,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = ReadOptions {
        max_block_size: cli.max_block_size * 1024,
        ..ReadOptions::default()
    };

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let file = NfFile::open_with_options(&input, options)?;
            let header = file.header();
            let stats = file.stats();
            if json {
                let info = FileInfo { header, ident: file.ident(), stats };
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }

            let compression = CompressionId::from_tag(header.compression)
                .map(|c| c.name())
                .unwrap_or("UNKNOWN");
            println!("── nfdump file ──────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Layout version {}", header.version);
            println!("  Creator        0x{:x}", header.creator_version);
            println!("  Created        {}", format_secs(header.created));
            println!("  Compression    {}", compression);
            println!("  Blocks         {}", header.block_count);
            println!("  Appendix       {} block(s)", header.appendix_blocks);
            println!("  Ident          {}", file.ident());
            println!("  Flows          {} (tcp {}, udp {}, icmp {}, other {})",
                     stats.num_flows, stats.num_flows_tcp, stats.num_flows_udp,
                     stats.num_flows_icmp, stats.num_flows_other);
            println!("  Packets        {}", stats.num_packets);
            println!("  Bytes          {}", stats.num_bytes);
            println!("  First seen     {}", format_msec(stats.first_seen));
            println!("  Last seen      {}", format_msec(stats.last_seen));
            println!("  Seq failures   {}", stats.sequence_failure);
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { input, order_by, desc, limit } => {
            let file = NfFile::open_with_options(&input, options)?;
            let mut stream = file.records()?;
            if let Some(key) = order_by {
                let direction = if desc { Direction::Descending } else { Direction::Ascending };
                stream = stream.order_by(&key, direction)?;
            }

            let mut printed = 0usize;
            for record in stream.by_ref() {
                let record = record?;
                println!("{}", format_record(&record));
                printed += 1;
                if limit.is_some_and(|n| printed >= n) {
                    break;
                }
            }
            drop(stream);
            eprintln!("{} record(s)", printed);
        }

        // ── Exporters ────────────────────────────────────────────────────────
        Commands::Exporters { input, json } => {
            let file = NfFile::open_with_options(&input, options)?;
            let mut stream = file.records()?;
            for record in stream.by_ref() {
                record?;
            }
            let report = stream.finish();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("{:>5} {:<40} {:>7} {:>10} {:>12} {:>14} {:>8}",
                     "SysID", "IP", "Version", "ID", "Flows", "Packets", "SeqFail");
            for e in report.exporters.exporters() {
                let ip = e.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into());
                println!("{:>5} {:<40} {:>7} {:>10} {:>12} {:>14} {:>8}",
                         e.sysid, ip, e.version, e.id, e.flows, e.packets, e.sequence_failures);
                for s in &e.samplers {
                    println!("      sampler id={} algorithm={} packet interval={} space interval={}",
                             s.id, s.algorithm, s.packet_interval, s.space_interval);
                }
            }
            eprintln!("{} record(s), {} corrupt record(s), {} corrupt block(s), {} unknown extension(s)",
                      report.records, report.corrupt_records, report.corrupt_blocks,
                      report.unknown_extensions);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn format_msec(msec: u64) -> String {
    DateTime::from_timestamp_millis(msec as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| msec.to_string())
}

fn format_secs(secs: u64) -> String {
    DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn proto_name(proto: u8) -> String {
    match proto {
        1  => "ICMP".into(),
        6  => "TCP".into(),
        17 => "UDP".into(),
        47 => "GRE".into(),
        50 => "ESP".into(),
        58 => "ICMP6".into(),
        p  => p.to_string(),
    }
}

fn endpoint(addr: Option<IpAddr>, port: u16) -> String {
    match addr {
        Some(IpAddr::V6(a)) => format!("[{}]:{}", a, port),
        Some(a)             => format!("{}:{}", a, port),
        None                => format!("-:{}", port),
    }
}

fn format_record(r: &FlowRecordV3) -> String {
    let Some(g) = r.generic_flow() else {
        return format!("{} record without flow data, exporter {}", r.source_kind().name(), r.exporter_id());
    };
    let (packet_interval, _) = r.sampling();
    let mut line = format!(
        "{}  {:>8.3}s  {:<5} {:>45} -> {:<45} {:>8} {:>10}",
        format_msec(g.msec_first),
        g.msec_last.saturating_sub(g.msec_first) as f64 / 1000.0,
        proto_name(g.proto),
        endpoint(r.src_addr(), g.src_port),
        endpoint(r.dst_addr(), g.dst_port),
        g.in_packets,
        g.in_bytes,
    );
    if packet_interval > 1 {
        line.push_str(&format!("  1:{}", packet_interval));
    }
    if let Some((src, dst)) = r.nat_addresses() {
        line.push_str(&format!("  nat {} -> {}", src, dst));
    }
    line
}
