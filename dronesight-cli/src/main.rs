// dronesight: batch classification of 802.11 capture logs.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use dronesight_core::parser::open;
use dronesight_core::reassembly::collect_by_transmitter;
use dronesight_core::{
    ClassificationOrchestrator, ClassifiedDevice, ConcurrentPacketReassembler, FrameParser,
    FrameRecord, FrameStats, Layout, MarkovModel, NearestCentroid, ObservationTransformer,
    PacketReassembler, ReadError, RuleClassifier, ThreadPool,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "dronesight", version, about = "Classify drones, controllers and access points in 802.11 capture logs")]
struct Cli {
    /// Config file (default: ~/.config/dronesight/config.toml, then /etc/dronesight/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify every transmitter in a capture
    Classify {
        /// Combined log (header and decoded lines per record)
        log: Option<PathBuf>,
        /// Separated physical-layer header file (*_phy.log)
        #[arg(long, requires = "body", conflicts_with = "log")]
        header: Option<PathBuf>,
        /// Separated decoded body file (*_parser.log)
        #[arg(long, requires = "header")]
        body: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = LayoutArg::Interleaved)]
        layout: LayoutArg,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Reassemble packets on the worker pool and list transmitters
    Reassemble {
        log: PathBuf,
        #[arg(long, value_enum, default_value_t = LayoutArg::Interleaved)]
        layout: LayoutArg,
        /// Worker threads (overrides config)
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Print hotspots, their clients and the remaining edges
    Topology {
        log: PathBuf,
        #[arg(long, value_enum, default_value_t = LayoutArg::Interleaved)]
        layout: LayoutArg,
    },
    /// Frame counts by correctness and type
    Stats {
        log: PathBuf,
        #[arg(long, value_enum, default_value_t = LayoutArg::Interleaved)]
        layout: LayoutArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    /// Header, hex and decoded line per record
    Interleaved,
    /// Header (hex inline) and decoded line per record
    Paired,
}

impl LayoutArg {
    /// Separated-file names win over the flag.
    fn resolve(self, path: &Path) -> Layout {
        Layout::from_path(path).unwrap_or(match self {
            LayoutArg::Interleaved => Layout::Interleaved,
            LayoutArg::Paired => Layout::Paired,
        })
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<ReadError>().map_or(1, ReadError::code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Classify {
            log,
            header,
            body,
            layout,
            json,
        } => {
            let parser = FrameParser::new()?;
            let frames = match (log, header, body) {
                (Some(log), _, _) => read_log(&parser, &log, layout)?,
                (None, Some(header), Some(body)) => parser
                    .read_separated(&header, &body)
                    .with_context(|| format!("reading {} + {}", header.display(), body.display()))?,
                _ => bail!("give a capture log or --header/--body"),
            };
            classify(&cfg, &frames, json)
        }
        Command::Reassemble {
            log,
            layout,
            threads,
        } => reassemble(&cfg, &log, layout.resolve(&log), threads),
        Command::Topology { log, layout } => {
            let frames = read_log(&FrameParser::new()?, &log, layout)?;
            let mut graph = dronesight_core::TopologyGraph::new();
            for f in &frames {
                graph.add_frame(f);
            }
            print!("{graph}");
            Ok(())
        }
        Command::Stats { log, layout } => {
            let frames = read_log(&FrameParser::new()?, &log, layout)?;
            println!("{}", FrameStats::from_frames(&frames));
            for (mac, packets) in collect_by_transmitter(&frames) {
                println!("{mac}: {} packets", packets.len());
            }
            Ok(())
        }
    }
}

fn read_log(parser: &FrameParser, path: &Path, layout: LayoutArg) -> anyhow::Result<Vec<FrameRecord>> {
    let frames = parser
        .read_file(path, layout.resolve(path))
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(frames)
}

fn build_orchestrator(cfg: &Config) -> anyhow::Result<ClassificationOrchestrator> {
    let rules = cfg.rules.rule_set().context("vendor prefix in [rules.vendors]")?;
    let mut orchestrator = ClassificationOrchestrator::new(
        RuleClassifier::new(rules),
        PacketReassembler::new(cfg.packet_threshold),
        ThreadPool::new(cfg.worker_threads()),
    );
    if let Some(path) = &cfg.estimator_path {
        let model = NearestCentroid::from_file(path)
            .with_context(|| format!("loading estimator {}", path.display()))?;
        orchestrator = orchestrator.with_estimator(Box::new(model));
    }
    match (&cfg.sequence_model_path, &cfg.transformer_path) {
        (Some(model), Some(transformer)) => {
            let model = MarkovModel::from_file(model)
                .with_context(|| format!("loading sequence model {}", model.display()))?;
            let transformer = ObservationTransformer::from_file(transformer)
                .with_context(|| format!("loading transformer {}", transformer.display()))?;
            orchestrator = orchestrator.with_sequence_model(Box::new(model), transformer);
        }
        (None, None) => {}
        _ => tracing::warn!("sequence fallback needs both sequence_model_path and transformer_path"),
    }
    Ok(orchestrator)
}

fn classify(cfg: &Config, frames: &[FrameRecord], json: bool) -> anyhow::Result<()> {
    let mut orchestrator = build_orchestrator(cfg)?;
    orchestrator.handle_frames(frames);
    orchestrator.classified();
    let mut devices: Vec<ClassifiedDevice> = orchestrator.devices().values().cloned().collect();
    devices.extend(orchestrator.unclassified_devices());
    devices.sort_by(|a, b| b.confidence.cmp(&a.confidence).then(a.mac.cmp(&b.mac)));

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    println!("{:<19}{:<19}{:<12}{:<28}annotation", "mac", "role", "confidence", "source");
    for d in &devices {
        println!(
            "{:<19}{:<19}{:<12}{:<28}{}",
            d.mac.to_string(),
            d.device_type.to_string(),
            d.confidence.to_string(),
            d.source.to_string(),
            d.annotation.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn reassemble(cfg: &Config, log: &Path, layout: Layout, threads: Option<usize>) -> anyhow::Result<()> {
    let pool = ThreadPool::new(threads.unwrap_or_else(|| cfg.worker_threads()));
    let reassembler = Arc::new(ConcurrentPacketReassembler::new(cfg.packet_threshold));
    let parser = Arc::new(FrameParser::new()?);
    let reader = open(log)?;
    let records = reassembler
        .ingest(reader, layout, &parser, &pool)
        .with_context(|| format!("reading {}", log.display()))?;
    tracing::info!(records, workers = pool.size(), "reassembled");

    while let Some(mac) = reassembler.take_ready() {
        let n = reassembler.snapshot(mac).map_or(0, |p| p.len());
        println!("{mac}: ready, {n} packets");
    }
    for mac in reassembler.macs() {
        if !reassembler.is_ready(mac) {
            let n = reassembler.snapshot(mac).map_or(0, |p| p.len());
            println!("{mac}: {n} packets");
        }
    }
    Ok(())
}
