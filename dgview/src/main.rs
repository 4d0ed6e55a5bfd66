use clap::Parser;
use dgview::{Access, Analyzer, Filter};
use dgwire::HWord;
use log::error;
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser)]
#[command(name = "dgview", about = "Explore a datagrind trace")]
struct Args {
    /// Trace file written by the recorder.
    trace: PathBuf,

    /// Keep only accesses intersecting a range tracked under one of these
    /// labels.
    #[arg(long, value_delimiter = ',', value_name = "LABELS")]
    ranges: Vec<String>,

    /// Keep only accesses made while one of these events is open.
    #[arg(long, value_delimiter = ',', value_name = "LABELS")]
    events: Vec<String>,

    /// Drop accesses that fall outside every live heap block.
    #[arg(long)]
    malloc_only: bool,

    /// Print the kept access nearest to the query point and exit. RATIO
    /// scales address distance relative to sequence distance (default 1).
    #[arg(long, value_name = "ADDR,ISEQ[,RATIO]")]
    nearest: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let filter = Filter {
        ranges: args.ranges.into_iter().collect(),
        events: args.events.into_iter().collect(),
        malloc_only: args.malloc_only,
    };

    let analyzer = match Analyzer::load_path(&args.trace, &filter) {
        Ok(a) => a,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if analyzer.index.is_empty() {
        eprintln!("No accesses match the criteria.");
        return ExitCode::SUCCESS;
    }

    if let Some(query) = &args.nearest {
        let Some((addr, iseq, ratio)) = parse_query(query) else {
            eprintln!("--nearest expects ADDR,ISEQ[,RATIO] with RATIO > 0");
            return ExitCode::from(2);
        };
        // The index is non-empty, so a nearest access always exists.
        let access = analyzer.index.nearest(addr, iseq, ratio).unwrap();
        print_access(&analyzer, &access);
    } else {
        println!(
            "{} accesses in {} runs over {} pages \
             ({} block definitions, {} contexts, {} heap blocks)",
            analyzer.index.n_kept(),
            analyzer.index.n_runs(),
            analyzer.remap.n_pages(),
            analyzer.index.n_bbdefs(),
            analyzer.index.n_contexts(),
            analyzer.index.n_blocks(),
        );
    }
    ExitCode::SUCCESS
}

fn parse_query(s: &str) -> Option<(HWord, u64, f64)> {
    let mut parts = s.split(',');
    let addr = parse_word(parts.next()?)?;
    let iseq = parts.next()?.parse().ok()?;
    let ratio = match parts.next() {
        Some(r) => r.parse().ok()?,
        None => 1.0,
    };
    if parts.next().is_some() || ratio <= 0.0 {
        return None;
    }
    Some((addr, iseq, ratio))
}

fn parse_word(s: &str) -> Option<HWord> {
    match s.strip_prefix("0x") {
        Some(hex) => HWord::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn print_access(analyzer: &Analyzer, access: &Access) {
    println!(
        "{:#x} ({}, {} bytes) at iseq {}",
        access.addr, access.dir, access.size, access.iseq
    );
    if let Some(block) = access.block {
        println!(
            "  in heap block {:#x} (size {:#x}) allocated at",
            block.addr, block.size
        );
        for ip in &block.stack {
            println!("    {}", analyzer.symbols.resolve(*ip));
        }
    }
    println!("  issued at");
    for ip in &access.stack {
        println!("    {}", analyzer.symbols.resolve(*ip));
    }
}
