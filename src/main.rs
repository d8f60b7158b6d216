use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portprobe::scanner::{self, CallbackObserver, ScanObserver};
use portprobe::types::{ProtocolMode, ScanReport};
use portprobe::{hosts, ports, ScanConfig, ScanError};

/// portprobe: check TCP/UDP reachability of ports on a host or a CIDR range.
#[derive(Debug, Clone, Parser)]
#[command(name = "portprobe", version, about, long_about = None)]
struct Cli {
    /// Hostname, IP address or CIDR block (e.g. 192.168.1.0/24).
    /// Defaults to `default_host` from the config.
    target: Option<String>,

    /// Ports to check, e.g. `22,80,8000-8010`. Defaults to `default_ports`, then a built-in list.
    #[arg(short, long)]
    ports: Option<String>,

    /// JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Probe UDP instead of TCP.
    #[arg(long, conflicts_with = "both")]
    udp: bool,

    /// Probe both TCP and UDP.
    #[arg(long)]
    both: bool,

    /// Max concurrent probes.
    #[arg(long)]
    threads: Option<usize>,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Extra DNS resolution attempts.
    #[arg(long)]
    retries: Option<u32>,

    /// Shuffle port order.
    #[arg(long)]
    randomize: bool,

    /// Sleep a random delay before each probe.
    #[arg(long)]
    jitter: bool,

    /// Send probes as two IP fragments (needs raw-socket privileges).
    #[arg(long)]
    fragmented: bool,

    /// Read service banners from open TCP ports.
    #[arg(long)]
    banners: bool,

    /// Only list open ports.
    #[arg(long = "open-only")]
    open_only: bool,

    /// Scan the first `max_cidr_hosts` addresses of a block that is larger than the limit.
    #[arg(long = "allow-truncate")]
    allow_truncate: bool,

    /// Print the report as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let cfg = effective_config(&cli)?;

    let target = cli
        .target
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| cfg.default_host.clone());
    if target.trim().is_empty() {
        bail!("no target given and no default_host configured");
    }

    let port_spec = cli.ports.clone().unwrap_or_else(|| cfg.default_ports.clone());
    let port_list = if port_spec.trim().is_empty() {
        ports::default_ports()
    } else {
        ports::parse_port_spec(&port_spec)?
    };

    let resolved = hosts::resolve_targets(
        &target,
        cfg.max_cidr_hosts,
        cfg.retry_count,
        cli.allow_truncate,
    )
    .await;
    let targets = match resolved {
        Err(e @ ScanError::CidrTooLarge { .. }) => {
            bail!("{e}; pass --allow-truncate to scan the first {} hosts", cfg.max_cidr_hosts)
        }
        other => other?,
    };
    info!(target = %target, hosts = targets.len(), ports = port_list.len(), "targets resolved");

    let observer: Arc<dyn ScanObserver> = if std::io::stderr().is_terminal() && !cli.json {
        Arc::new(CallbackObserver::new(
            |done: u64, total: u64| {
                let mut err = std::io::stderr().lock();
                let _ = write!(err, "\rscanned {done}/{total}");
                let _ = err.flush();
            },
            |_: &ScanReport| eprintln!(),
        ))
    } else {
        Arc::new(scanner::NoopObserver)
    };

    let handle = scanner::run_scan(targets, port_list, cfg.options(), observer);

    // Ctrl-C cancels the scan.
    let cancel_ctrlc = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling scan");
            cancel_ctrlc.cancel();
        }
    });

    let report = handle.wait().await?;
    if cli.json {
        serde_json::to_writer_pretty(std::io::stdout().lock(), &report)
            .context("failed to write JSON")?;
        println!();
    } else {
        print_results_table(&target, &report);
    }
    Ok(())
}

fn effective_config(cli: &Cli) -> Result<ScanConfig> {
    let mut cfg = match cli.config.as_deref() {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    if cli.udp {
        cfg.protocol = ProtocolMode::Udp;
    }
    if cli.both {
        cfg.protocol = ProtocolMode::Both;
    }
    if let Some(t) = cli.threads {
        cfg.max_concurrent_threads = t;
    }
    if let Some(ms) = cli.timeout_ms {
        cfg.timeout = ms as f64 / 1000.0;
    }
    if let Some(r) = cli.retries {
        cfg.retry_count = r;
    }
    cfg.randomize_ports |= cli.randomize;
    cfg.variable_delay_scan |= cli.jitter;
    cfg.fragmented_packets |= cli.fragmented;
    cfg.banner_grabbing |= cli.banners;
    cfg.show_open_only |= cli.open_only;
    cfg.validate()?;
    Ok(cfg)
}

fn print_results_table(target: &str, report: &ScanReport) {
    let rows = report.presentable();
    let mut host_w = "host".len();
    let mut svc_w = "service".len();
    let mut banner_w = "banner".len();
    for r in &rows {
        host_w = host_w.max(r.host.to_string().len());
        svc_w = svc_w.max(r.service.len());
        if let Some(b) = &r.banner {
            banner_w = banner_w.max(b.chars().count().min(60));
        }
    }
    let port_w = "port/proto".len();
    let status_w = "OPEN|FILTERED".len();
    let lat_w = "latency_ms".len();

    println!(
        "\n{target}: {} open (checked {} of {}{})",
        report.open_count,
        report.completed,
        report.total_scans,
        if report.cancelled { ", cancelled" } else { "" }
    );
    println!(
        "{:<host_w$}  {:<port_w$}  {:<status_w$}  {:<svc_w$}  {:>lat_w$}  {:<banner_w$}",
        "host", "port/proto", "status", "service", "latency_ms", "banner",
    );
    println!(
        "{:-<host_w$}  {:-<port_w$}  {:-<status_w$}  {:-<svc_w$}  {:-<lat_w$}  {:-<banner_w$}",
        "", "", "", "", "", "",
    );
    for r in rows {
        let bsnip: String = r.banner.as_deref().unwrap_or_default().chars().take(60).collect();
        println!(
            "{:<host_w$}  {:<port_w$}  {:<status_w$}  {:<svc_w$}  {:>lat_w$}  {:<banner_w$}",
            r.host.to_string(),
            format!("{}/{}", r.port, r.protocol.to_string().to_lowercase()),
            r.status.to_string(),
            r.service,
            r.response_time_ms,
            bsnip,
        );
    }
}
