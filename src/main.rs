use anyhow::{Context, Result, bail};
use clap::Parser;
use procshaper::backends::BackendInfo;
use procshaper::backends::filter::detect_filter_backends;
use procshaper::backends::monitor::detect_counter_sources;
use procshaper::backends::process::socket_mapper::detect_connection_tables;
use procshaper::rate::{format_bytes, mbps_to_bytes_per_sec};
use procshaper::{BandwidthController, Config};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::time::{Instant, interval, sleep_until};

/// procshaper - per-process network rate limiter
#[derive(Parser, Debug)]
#[command(name = "procshaper")]
#[command(version)]
#[command(about = "Per-process network bandwidth throttler", long_about = None)]
struct Args {
    /// List processes with their current speeds and exit
    #[arg(long)]
    list: bool,

    /// How long to sample traffic before printing the list
    #[arg(long, value_name = "SECONDS", default_value_t = 3)]
    sample_secs: u64,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,

    /// PID to throttle
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,

    /// Download limit (e.g., "1mb", "500kb", "1.5mb") - requires --pid
    #[arg(long, value_name = "RATE", conflicts_with = "download_mbps")]
    download_limit: Option<String>,

    /// Upload limit (e.g., "1mb", "500kb", "1.5mb") - requires --pid
    #[arg(long, value_name = "RATE", conflicts_with = "upload_mbps")]
    upload_limit: Option<String>,

    /// Download limit in megabits per second - requires --pid
    #[arg(long, value_name = "MBPS")]
    download_mbps: Option<u64>,

    /// Upload limit in megabits per second - requires --pid
    #[arg(long, value_name = "MBPS")]
    upload_mbps: Option<u64>,

    /// Duration to run throttle in seconds (default: run until Ctrl+C)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Alternate configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn print_backend_group(title: &str, backends: Vec<BackendInfo>) {
    println!("{}:", title);
    if backends.is_empty() {
        println!("  (none compiled in)");
    }
    for backend in backends {
        let status = if backend.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:20} [priority: {:?}] {}",
            backend.name, backend.priority, status
        );
    }
    println!();
}

fn print_available_backends() {
    println!("procshaper v{} - Available Backends\n", env!("CARGO_PKG_VERSION"));
    print_backend_group("Socket Mappers", detect_connection_tables());
    print_backend_group("Traffic Counters", detect_counter_sources());
    print_backend_group("Filter Backends", detect_filter_backends());

    println!("Usage:");
    println!("  procshaper --list [--sample-secs <SECONDS>]");
    println!(
        "  procshaper --pid <PID> [--download-limit <RATE>] [--upload-limit <RATE>] [--duration <SECONDS>]"
    );
    println!("    Examples:");
    println!("      procshaper --pid 1234 --download-limit 1mb --upload-limit 500kb");
    println!("      procshaper --pid 1234 --download-mbps 8 --duration 60");
}

/// Resolve one direction's limit from either the rate string or the Mbps flag.
/// A malformed rate string is rejected rather than silently blocking traffic.
fn resolve_limit(rate: Option<&str>, mbps: Option<u64>) -> Result<Option<u64>> {
    if let Some(mbps) = mbps {
        return Ok(Some(mbps_to_bytes_per_sec(mbps)));
    }
    let Some(rate) = rate else {
        return Ok(None);
    };

    let limit = BandwidthController::parse_rate(rate);
    let trimmed = rate.trim();
    if limit == 0 && !trimmed.starts_with('0') {
        bail!("Invalid rate: {:?}", rate);
    }
    Ok(Some(limit))
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

async fn run_list_mode(controller: &BandwidthController, sample_secs: u64) -> Result<()> {
    controller.refresh();
    controller.update_stats();
    tokio::time::sleep(Duration::from_secs(sample_secs)).await;
    controller.update_stats();

    println!(
        "{:>8}  {:24} {:>14} {:>14} {:>10} {:>10}",
        "PID", "NAME", "DOWN", "UP", "RX", "TX"
    );
    for process in controller.list_processes() {
        println!(
            "{:>8}  {:24} {:>14} {:>14} {:>10} {:>10}",
            process.pid,
            process.display_name(),
            BandwidthController::format_rate(process.download_speed),
            BandwidthController::format_rate(process.upload_speed),
            format_bytes(process.total_downloaded),
            format_bytes(process.total_uploaded)
        );
    }

    Ok(())
}

async fn run_throttle_mode(
    controller: &BandwidthController,
    config: &Config,
    args: &Args,
    pid: u32,
) -> Result<()> {
    let download = resolve_limit(args.download_limit.as_deref(), args.download_mbps)?;
    let upload = resolve_limit(args.upload_limit.as_deref(), args.upload_mbps)?;

    if download.is_none() && upload.is_none() {
        bail!("At least one download or upload limit is required with --pid");
    }

    controller.refresh();
    let name = controller
        .list_processes()
        .into_iter()
        .find(|p| p.pid == pid)
        .map(|p| p.display_name())
        .context(format!("No process with PID {}", pid))?;

    let describe = |limit: Option<u64>| {
        limit
            .map(BandwidthController::format_rate)
            .unwrap_or_else(|| "unlimited".to_string())
    };

    println!("Throttling process: {} (PID {})", name, pid);
    println!("  Download limit: {}", describe(download));
    println!("  Upload limit:   {}", describe(upload));
    match args.duration {
        Some(secs) => println!("  Duration:       {} seconds", secs),
        None => println!("  Duration:       Until Ctrl+C"),
    }
    println!();

    controller
        .try_start_throttle(
            pid,
            download.unwrap_or(u64::MAX),
            upload.unwrap_or(u64::MAX),
        )
        .context("Failed to apply throttle")?;
    println!("Throttle applied. Press Ctrl+C to stop and remove it...");

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut refresh_timer = interval(config.refresh_interval());
    let mut stats_timer = interval(config.stats_interval());

    loop {
        tokio::select! {
            _ = refresh_timer.tick() => {
                controller.refresh();
                if !controller.is_throttle_active(pid) {
                    println!("\nProcess {} exited, throttle released.", pid);
                    break;
                }
            }
            _ = stats_timer.tick() => {
                controller.update_stats();
                if let Some(stats) = controller.throttle_stats(pid) {
                    log::info!(
                        "PID {}: down passed={} dropped={}, up passed={} dropped={}",
                        pid,
                        format_bytes(stats.download.bytes_passed),
                        stats.download.packets_dropped,
                        format_bytes(stats.upload.bytes_passed),
                        stats.upload.packets_dropped
                    );
                }
            }
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                println!("\nDuration elapsed, removing throttle...");
                break;
            }
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, removing throttle...");
                break;
            }
        }
    }

    controller.shutdown();
    println!("Throttle removed.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let config = load_config(&args)?;
    let controller = BandwidthController::new(&config);

    if let Some(pid) = args.pid {
        return run_throttle_mode(&controller, &config, &args, pid).await;
    }

    if args.list {
        return run_list_mode(&controller, args.sample_secs).await;
    }

    print_available_backends();
    Ok(())
}
