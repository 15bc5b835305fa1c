// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use etr_regs::MemWidth;
use etr_sink::sim::{HostDma, SimulatedTmc};
use etr_sink::{AuxUpdate, EtrSink, Progress, SinkConfig, SinkRegistry};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
enum Command {
    /// Capture into the sink's own buffer and read it back
    Continuous {
        /// Bytes of synthetic trace to capture before each read
        #[arg(long, value_parser = parse_int::parse::<usize>, default_value = "0x1000")]
        bytes: usize,

        /// Number of capture/read cycles
        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "1")]
        reads: u32,

        /// Stop capture before reading instead of letting the read stop it
        #[arg(long)]
        disable: bool,

        /// Write the last snapshot here (binary)
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,

        /// Hex dump each snapshot
        #[arg(long)]
        dump: bool,
    },
    /// Run a streaming session, copying out after each burst of trace
    Stream {
        #[arg(long, value_parser = parse_int::parse::<usize>, default_value = "4")]
        pages: usize,

        #[arg(long, value_parser = parse_int::parse::<usize>, default_value = "0x1000")]
        page_size: usize,

        /// Report absolute output positions instead of byte counts
        #[arg(long)]
        snapshot: bool,

        /// Sizes of the trace bursts, comma separated
        #[arg(
            long,
            value_parser = parse_int::parse::<usize>,
            value_delimiter = ',',
            default_value = "0x100"
        )]
        bursts: Vec<usize>,

        /// Print the updates as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the sink configuration as JSON
    ShowConfig,
}

#[derive(Debug, Parser)]
struct Opts {
    /// Sink description (TOML); a 64 KiB sink named etr0 if not given
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Serialize)]
struct UpdateReport {
    burst: usize,
    captured: usize,
    copied: usize,
    truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    advance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    head: Option<u64>,
}

impl UpdateReport {
    fn new(burst: usize, captured: usize, update: Option<AuxUpdate>) -> UpdateReport {
        let (copied, truncated, progress) = match update {
            Some(u) => (u.copied, u.truncated, Some(u.progress)),
            None => (0, false, None),
        };
        UpdateReport {
            burst,
            captured,
            copied,
            truncated,
            advance: match progress {
                Some(Progress::Advance(n)) => Some(n),
                _ => None,
            },
            head: match progress {
                Some(Progress::Head(h)) => Some(h),
                _ => None,
            },
        }
    }
}

/// Recognizable synthetic trace: a running byte counter
fn synthetic(len: usize, seed: &mut u8) -> Vec<u8> {
    (0..len)
        .map(|_| {
            *seed = seed.wrapping_add(1);
            *seed
        })
        .collect()
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match &opts.config {
        Some(path) => SinkConfig::load(path)
            .with_context(|| format!("could not load sink config {}", path.display()))?,
        None => SinkConfig::new("etr0", 64 * 1024, MemWidth::Bits64),
    };

    let dma = Arc::new(HostDma::new());
    let tmc = SimulatedTmc::new(dma.clone());
    let registry = SinkRegistry::new();
    let name = config.name.clone();
    registry.register(EtrSink::new(config, Box::new(tmc.clone()), dma.clone())?)?;
    let sink = registry
        .get(&name)
        .ok_or_else(|| anyhow!("sink {name} vanished from the registry"))?;
    let mut seed = 0u8;

    match opts.cmd {
        Command::Continuous {
            bytes,
            reads,
            disable,
            out,
            dump,
        } => {
            sink.enable_continuous()?;
            let mut last = Vec::new();
            for cycle in 0..reads {
                let captured = tmc.emit(&synthetic(bytes, &mut seed));
                if disable {
                    sink.disable()?;
                }
                let read = sink.begin_read()?;
                let region = read.region();
                info!(
                    "read {cycle}: captured {captured:#x} bytes, snapshot is {:#x} bytes at offset {:#x}",
                    region.len, region.offset
                );
                last = read.to_vec();
                read.end();

                if dump {
                    for (i, line) in last.chunks(16).enumerate() {
                        println!("{:08x}: {}", i * 16, hex::encode(line));
                    }
                }
                if disable && cycle + 1 < reads {
                    sink.enable_continuous()?;
                }
            }
            if let Some(out) = out {
                std::fs::write(&out, &last)
                    .with_context(|| format!("could not write {}", out.display()))?;
                info!("snapshot written to {}", out.display());
            }
        }
        Command::Stream {
            pages,
            page_size,
            snapshot,
            bursts,
            json,
        } => {
            let mut session = sink.on_session_start(pages, page_size, snapshot)?;
            sink.on_session_set_cursor(&mut session, 0);
            sink.enable_streaming(&mut session)?;

            let mut reports = Vec::new();
            for (i, &burst) in bursts.iter().enumerate() {
                let captured = tmc.emit(&synthetic(burst, &mut seed));
                let report = UpdateReport::new(i, captured, sink.on_data_available(&mut session));
                if !json {
                    let progress = match (report.advance, report.head) {
                        (Some(n), _) => format!("advance {n:#x}"),
                        (_, Some(h)) => format!("head {h:#x}"),
                        _ => "ignored".to_string(),
                    };
                    println!(
                        "burst {i}: {:#x} in, {:#x} out, {progress}{}",
                        captured,
                        report.copied,
                        if report.truncated {
                            format!(" {}", "TRUNCATED".red())
                        } else {
                            String::new()
                        }
                    );
                }
                reports.push(report);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            info!("{:#x} bytes streamed in total", session.bytes_emitted());
            sink.on_session_end(session);
        }
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(sink.config())?);
        }
    }

    drop(sink);
    registry.remove(&name);
    Ok(())
}
