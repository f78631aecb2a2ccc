// HOLDFAST -- IDLE-RECLAMATION SHAPER FOR ALWAYS-FREE CLOUD INSTANCES
//
// CONTROL LOGIC LIVES IN THE LIBRARY CRATE (TESTED OFFLINE).
// THIS BINARY HANDLES: CONFIGURATION, STORAGE GUARDS, THREAD WIRING,
// SIGNALS, TELEMETRY OUTPUT.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use holdfast::cli::check::run_check;
use holdfast::clock;
use holdfast::config::{shape_by_name, Config, RING_SLOTS};
use holdfast::controller::{ControllerConfig, P95Controller, RING_FILE};
use holdfast::coordinator::Coordinator;
use holdfast::log_warn;
use holdfast::memory::MemoryOccupier;
use holdfast::metrics::{is_mount_point, MetricsStore, StorageLock};
use holdfast::netgen::{spawn_emitter, GenConfig, GenControl};
use holdfast::netstate::{FallbackConfig, Mode, NetFallback};
use holdfast::sensors::{detect_nic, read_link_speed, Sensors};
use holdfast::workers::WorkerPool;

// EXIT CODES: 2 = CONFIGURATION INVALID, 3 = PERSISTENCE UNAVAILABLE
const EXIT_CONFIG: i32 = 2;
const EXIT_PERSISTENCE: i32 = 3;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(about = "HOLDFAST -- RESOURCE SHAPER AGAINST ALWAYS-FREE IDLE RECLAMATION")]
struct Cli {
    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Run the shaper (default)
    Run(RunArgs),

    /// Check host prerequisites and storage
    Check(CheckArgs),
}

#[derive(Parser, Default)]
struct RunArgs {
    /// Shape template: e2-micro or a1-flex
    #[arg(long)]
    shape: Option<String>,

    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Interface to measure and emit on (default: first UP non-loopback)
    #[arg(long)]
    nic: Option<String>,

    /// Link bandwidth override in Mbit (virtio reports no speed)
    #[arg(long)]
    link_mbit: Option<f64>,

    #[arg(long)]
    tick_sec: Option<u64>,

    #[arg(long)]
    slot_len_sec: Option<u64>,

    /// Long-run fraction of high slots, e.g. 0.065
    #[arg(long)]
    target_ratio: Option<f64>,

    #[arg(long)]
    p95_min: Option<f64>,

    #[arg(long)]
    p95_max: Option<f64>,

    #[arg(long)]
    high_intensity: Option<f64>,

    #[arg(long)]
    baseline_intensity: Option<f64>,

    #[arg(long)]
    load_threshold: Option<f64>,

    #[arg(long)]
    load_resume: Option<f64>,

    #[arg(long)]
    cpu_stop: Option<f64>,

    #[arg(long)]
    mem_target: Option<f64>,

    #[arg(long)]
    mem_stop: Option<f64>,

    #[arg(long)]
    min_free_mb: Option<u64>,

    #[arg(long, value_enum)]
    net_mode: Option<Mode>,

    /// Comma-separated peer list, host[:port]
    #[arg(long)]
    net_peers: Option<String>,

    #[arg(long)]
    net_port: Option<u16>,

    /// Target egress as percent of link bandwidth
    #[arg(long)]
    net_target_pct: Option<f64>,

    #[arg(long)]
    net_ttl: Option<u32>,

    #[arg(long)]
    net_packet_bytes: Option<usize>,

    /// CPU worker count (default: one per logical core)
    #[arg(long)]
    workers: Option<usize>,

    /// Skip the storage mount-point check (development only)
    #[arg(long)]
    allow_non_mount: bool,
}

#[derive(Parser)]
struct CheckArgs {
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[arg(long)]
    nic: Option<String>,

    #[arg(long)]
    allow_non_mount: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        None => run_shaper(RunArgs::default()),
        Some(SubCmd::Run(args)) => run_shaper(args),
        Some(SubCmd::Check(args)) => {
            let storage = args
                .storage_dir
                .unwrap_or_else(|| PathBuf::from("/var/lib/holdfast"));
            if run_check(&storage, args.nic.as_deref(), args.allow_non_mount).is_err() {
                std::process::exit(1);
            }
        }
    }
}

fn run_shaper(args: RunArgs) -> ! {
    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("CONFIGURATION INVALID: {e}");
            eprintln!("FIX THE NAMED OPTIONS AND RESTART.");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = preflight_storage(&cfg) {
        eprintln!("PERSISTENCE UNAVAILABLE: {e}");
        eprintln!(
            "MOUNT A VOLUME AT {} (OR PASS --storage-dir / --allow-non-mount) AND RESTART.",
            cfg.storage_dir.display()
        );
        std::process::exit(EXIT_PERSISTENCE);
    }

    let lock = match StorageLock::acquire(&cfg.storage_dir) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("PERSISTENCE UNAVAILABLE: {e}");
            eprintln!("STOP THE OTHER INSTANCE OR POINT --storage-dir ELSEWHERE.");
            std::process::exit(EXIT_PERSISTENCE);
        }
    };

    match run_core(cfg, lock) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    }
}

fn build_config(args: &RunArgs) -> Result<Config> {
    let mut cfg = Config::default();

    let shape_name = args.shape.as_deref().unwrap_or("e2-micro");
    let shape = shape_by_name(shape_name)
        .with_context(|| format!("unknown shape {:?} (have: e2-micro, a1-flex)", shape_name))?;
    cfg.apply_shape(shape);

    macro_rules! take {
        ($field:ident, $arg:ident) => {
            if let Some(v) = args.$arg.clone() {
                cfg.$field = v;
            }
        };
    }
    take!(storage_dir, storage_dir);
    take!(tick_sec, tick_sec);
    take!(slot_len_sec, slot_len_sec);
    take!(target_ratio, target_ratio);
    take!(p95_min, p95_min);
    take!(p95_max, p95_max);
    take!(high_intensity, high_intensity);
    take!(baseline_intensity, baseline_intensity);
    take!(load_threshold, load_threshold);
    take!(load_resume, load_resume);
    take!(cpu_stop_pct, cpu_stop);
    take!(mem_target_pct, mem_target);
    take!(mem_stop_pct, mem_stop);
    take!(min_free_mb, min_free_mb);
    take!(net_mode, net_mode);
    take!(net_port, net_port);
    take!(net_target_pct, net_target_pct);
    take!(net_ttl, net_ttl);
    take!(net_packet_bytes, net_packet_bytes);
    if let Some(nic) = args.nic.clone() {
        cfg.nic = Some(nic);
    }
    if let Some(link) = args.link_mbit {
        cfg.link_mbit = Some(link);
    }
    if let Some(workers) = args.workers {
        cfg.workers = Some(workers);
    }
    if let Some(peers) = &args.net_peers {
        cfg.net_peers = peers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    cfg.allow_non_mount = args.allow_non_mount;

    cfg.validate()?;
    Ok(cfg)
}

fn preflight_storage(cfg: &Config) -> Result<()> {
    let dir = &cfg.storage_dir;
    if !dir.is_dir() {
        bail!("{} does not exist or is not a directory", dir.display());
    }
    if !cfg.allow_non_mount && !is_mount_point(dir)? {
        bail!(
            "{} is not a mount point -- the persistent volume is missing",
            dir.display()
        );
    }
    // WRITABILITY PROBE
    let probe = dir.join(".holdfast-write-probe");
    std::fs::write(&probe, b"probe")
        .with_context(|| format!("{} is not writable", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn run_core(cfg: Config, lock: StorageLock) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    let nr_cpus = {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            n as usize
        } else {
            1
        }
    };
    let nic = match cfg.nic.clone().or_else(|| detect_nic(Path::new("/sys"))) {
        Some(nic) => nic,
        None => bail!("no usable network interface found; pass --nic"),
    };
    let link_mbit = match cfg
        .link_mbit
        .or_else(|| read_link_speed(Path::new("/sys"), &nic))
    {
        Some(link) => link,
        None => bail!("{} reports no link speed; pass --link-mbit", nic),
    };

    println!("HOLDFAST v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "SHAPE:           {} (MEMORY {}, EXTERNAL EGRESS {})",
        cfg.shape.name,
        if cfg.counts_memory { "COUNTED" } else { "NOT COUNTED" },
        if cfg.requires_external_egress { "REQUIRED" } else { "OPTIONAL" },
    );
    println!("CPUS:            {}", nr_cpus);
    println!("NIC:             {} ({} MBIT)", nic, link_mbit);
    println!("STORAGE:         {}", cfg.storage_dir.display());
    println!(
        "P95 BAND:        {:.0}-{:.0}% (RATIO TARGET {:.1}%)",
        cfg.p95_min,
        cfg.p95_max,
        cfg.target_ratio * 100.0
    );
    println!(
        "INTENSITY:       HIGH {:.0}% / BASELINE {:.0}%",
        cfg.high_intensity, cfg.baseline_intensity
    );
    println!(
        "NET MODE:        {} ({} PEERS, {:.0}% OF LINK)",
        cfg.net_mode.label(),
        cfg.net_peers.len(),
        cfg.net_target_pct
    );
    println!();

    let store = Arc::new(MetricsStore::open(
        &cfg.storage_dir,
        cfg.p95_cache_ttl_sec,
        cfg.integrity_probe_interval_sec,
    )?);
    let maintenance = MetricsStore::spawn_maintenance(
        Arc::clone(&store),
        Arc::clone(&shutdown),
        cfg.purge_interval_sec,
    );

    let sensors = Sensors::new(&nic, link_mbit, nr_cpus)?;

    let controller = P95Controller::new(ControllerConfig {
        slot_len_sec: cfg.slot_len_sec,
        ring_slots: RING_SLOTS,
        target_ratio: cfg.target_ratio,
        p95_min: cfg.p95_min,
        p95_max: cfg.p95_max,
        p95_deadband: cfg.p95_deadband,
        high_intensity: cfg.high_intensity,
        baseline_intensity: cfg.baseline_intensity,
        max_consecutive_skipped_slots: cfg.max_consecutive_skipped_slots,
        ring_flush_every: cfg.ring_flush_every,
        ring_path: cfg.storage_dir.join(RING_FILE),
    });

    let pool = WorkerPool::spawn(
        cfg.workers.unwrap_or(nr_cpus),
        cfg.busy_slice_ms,
        Arc::clone(&shutdown),
    );

    let mut occupier = MemoryOccupier::new(cfg.mem_step_mb)?;
    if cfg.mem_target_pct > 0.0 {
        occupier.spawn_toucher(cfg.touch_interval_ms, Arc::clone(&shutdown));
    }

    let fallback = NetFallback::new(
        FallbackConfig {
            risk_pct: cfg.net_risk_pct,
            counts_memory: cfg.counts_memory,
            debounce_sec: cfg.net_debounce_sec,
            min_on_sec: cfg.net_min_on_sec,
            min_off_sec: cfg.net_min_off_sec,
            ema_tau_sec: cfg.net_ema_tau_sec,
            target_mbps: cfg.net_target_mbps(),
        },
        cfg.net_mode,
        clock::now_ts(),
    );

    let gen_control = Arc::new(GenControl::new());
    let emitter = if !cfg.net_peers.is_empty() && cfg.net_mode != Mode::Off {
        Some(spawn_emitter(
            GenConfig {
                peers: cfg.net_peers.clone(),
                port: cfg.net_port,
                require_external: cfg.requires_external_egress,
                packet_bytes: cfg.net_packet_bytes,
                ttl: cfg.net_ttl,
                validation_interval_sec: cfg.net_validation_interval_sec,
                validation_timeout_ms: cfg.net_validation_timeout_ms,
                min_tx_delta: cfg.net_min_tx_delta,
                validation_misses: cfg.net_validation_misses,
                err_threshold: cfg.net_err_threshold,
                rep_floor: cfg.net_rep_floor,
                error_cooldown_sec: cfg.net_error_cooldown_sec,
                tx_bytes_path: sensors.tx_bytes_path().to_path_buf(),
            },
            Arc::clone(&gen_control),
            Arc::clone(&shutdown),
        ))
    } else {
        None
    };

    println!("HOLDFAST IS ACTIVE (CTRL+C TO EXIT)");

    let coordinator = Coordinator::new(
        cfg,
        store,
        controller,
        pool,
        occupier,
        fallback,
        gen_control,
        Arc::clone(&shutdown),
    );
    let telemetry = coordinator.run(sensors)?;

    println!("HOLDFAST IS SHUTTING DOWN");
    shutdown.store(true, Ordering::Relaxed);
    if let Some(handle) = emitter {
        let _ = handle.join();
    }
    if maintenance.join().is_err() {
        log_warn!("MAINTENANCE THREAD PANICKED");
    }

    telemetry.summary();
    if let Some(json) = telemetry.latest_json() {
        println!("SNAPSHOT: {}", json);
    }

    drop(lock);
    println!("HOLDFAST OUT.");
    Ok(())
}
