#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs::MountOptions;
use cfs_harness::SuiteReport;
use cfs_harness::scenarios::{self, ALL};
use std::env;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("run") => run_scenarios(&args[1..]),
        Some("options") => resolve_options(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_scenarios(args: &[String]) -> Result<()> {
    let ids: Vec<&str> = if args.is_empty() || args.iter().any(|a| a == "all") {
        ALL.to_vec()
    } else {
        args.iter().map(String::as_str).collect()
    };
    let reports = ids
        .iter()
        .map(|id| scenarios::run(id).with_context(|| format!("scenario {id} could not run")))
        .collect::<Result<Vec<_>>>()?;
    let suite = SuiteReport::from_reports(reports);
    println!("{}", serde_json::to_string_pretty(&suite)?);
    if suite.failed > 0 {
        bail!("{} scenario(s) failed", suite.failed);
    }
    Ok(())
}

fn resolve_options(args: &[String]) -> Result<()> {
    let mut json = None;
    let mut opts = None;
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let raw = args.get(index + 1).context("--config requires a path")?;
                json = Some(Path::new(raw));
                index += 2;
            }
            "-o" => {
                let raw = args.get(index + 1).context("-o requires an option string")?;
                opts = Some(raw.as_str());
                index += 2;
            }
            other => bail!("unknown options argument: {other}"),
        }
    }
    let options = MountOptions::load(json, opts)?;
    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}

fn print_usage() {
    println!("cfs-harness: end-to-end write path scenarios");
    println!();
    println!("USAGE:");
    println!("  cfs-harness run [all|a|b|c|d|e]...");
    println!("  cfs-harness options [--config FILE] [-o OPTS]");
    println!();
    println!("SCENARIOS:");
    println!("  a  200,000 byte compressed write round trip");
    println!("  b  50 byte file stored inline");
    println!("  c  No-COW overwrite of an exclusively owned extent");
    println!("  d  IO error on an ordered extent's write");
    println!("  e  truncate into an in-flight write");
    println!();
    println!("EXAMPLES:");
    println!("  cfs-harness run all");
    println!("  cfs-harness options -o compress=zstd:5,nodatasum");
}
