use lottie_orchestra::cli::Args;
use lottie_orchestra::config::{self, Settings};
use lottie_orchestra::core::loader::FsFetcher;
use lottie_orchestra::core::manager::{AnimationManager, ManagerServices};
use lottie_orchestra::entities::{
    AnimationPayload, ClockDeadline, Container, InstanceConfig, InstanceEvent, InstanceEventKind, LoadStrategy, ManualClock,
    MemoryProbe, Rect, SharedViewport, SystemMemoryProbe,
};
use lottie_orchestra::headless::HeadlessEngine;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const VIEWPORT_W: f32 = 1280.0;
const VIEWPORT_H: f32 = 720.0;
const TILE_W: f32 = 160.0;
const TILE_H: f32 = 120.0;
const COLUMNS: usize = 8;

/// Tile for instance `index`: the first `visible` fill the viewport grid,
/// the rest stack below the fold.
fn layout(index: usize, visible: usize) -> Rect {
    if index < visible {
        let col = (index % COLUMNS) as f32;
        let row = (index / COLUMNS) as f32;
        Rect::new(col * TILE_W, row * TILE_H, TILE_W, TILE_H)
    } else {
        let below = (index - visible) as f32;
        Rect::new(0.0, VIEWPORT_H + TILE_H + below * (TILE_H + 10.0), TILE_W, TILE_H)
    }
}

/// `DataFailed` events already dispatched for `id`. Eager loads fail inside
/// `create()`, before any subscriber can be attached.
fn failures_during_create(manager: &AnimationManager, id: uuid::Uuid) -> u64 {
    manager
        .poll_events(id)
        .iter()
        .filter(|e| matches!(e, InstanceEvent::DataFailed { .. }))
        .count() as u64
}

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("Lottie Orchestra starting...");
    debug!("Command-line args: {:?}", args);

    let settings_path = config::config_file(config::SETTINGS_FILE, &path_config);
    let mut settings = Settings::load_or_default(&settings_path).unwrap_or_else(|e| {
        warn!("{:#}; using default settings", e);
        Settings::default()
    });
    if let Some(size) = args.pool_size {
        settings.pool.max_size = size;
    }
    if let Some(limit) = args.memory_limit_mb {
        settings.memory.memory_limit_mb = limit;
    }
    if args.no_workers {
        settings.workers.enabled = false;
    }
    if args.save_settings {
        settings.save(&settings_path)?;
        info!("Settings written to {}", settings_path.display());
    }

    // ===== Host =====
    let clock = Arc::new(ManualClock::new());
    let viewport = Arc::new(SharedViewport::new(Rect::new(0.0, 0.0, VIEWPORT_W, VIEWPORT_H)));
    let probe: Arc<dyn MemoryProbe> = Arc::new(SystemMemoryProbe::new());
    let engine = HeadlessEngine::new();
    let engine_stats = engine.stats();

    let services = ManagerServices::from_settings(
        &settings,
        Arc::new(engine),
        Arc::new(FsFetcher::default()),
        clock.clone(),
        viewport.clone(),
        Some(probe),
    );
    let manager = AnimationManager::new(services);

    // ===== Payloads =====
    let mut sources: Vec<String> = Vec::new();
    for path in &args.payloads {
        let key = path.to_string_lossy().to_string();
        match manager.preload(&key) {
            Ok(payload) => {
                info!("{}: {} frames @ {} fps", key, payload.total_frames(), payload.fr);
                sources.push(key);
            }
            Err(e) => error!("Skipping {}: {}", key, e),
        }
    }
    if sources.is_empty() && !args.payloads.is_empty() {
        warn!("No payload could be loaded, falling back to a synthetic animation");
    }

    // ===== Instances =====
    let warnings = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));
    for i in 0..args.instances {
        let name = format!("anim-{:03}", i);
        let container = Container::new(name.clone(), layout(i, args.visible));
        let config = InstanceConfig::new(name.clone())
            .with_container(container)
            .with_strategy(args.strategy)
            .with_autoplay(true);
        let config = match sources.get(i % sources.len().max(1)) {
            Some(path) => config.with_path(path.clone()),
            None => config.with_source(AnimationPayload::synthetic(&name, 30.0, 90.0, 160, 120)),
        };

        let id = manager.create(config);
        failures.fetch_add(failures_during_create(&manager, id), Ordering::Relaxed);
        let w = Arc::clone(&warnings);
        manager.subscribe(id, InstanceEventKind::PerformanceWarning, move |_| {
            w.fetch_add(1, Ordering::Relaxed);
        });
        let f = Arc::clone(&failures);
        manager.subscribe(id, InstanceEventKind::DataFailed, move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });
    }
    info!("Created {} instances", args.instances);

    // Explicit-load strategy: the driver is the caller that loads
    if args.strategy == LoadStrategy::Lazy {
        for id in manager.instance_ids() {
            if let Err(e) = manager.load(id) {
                warn!("Load of {} failed: {}", id, e);
            }
        }
    }

    // ===== Simulation =====
    let frame_ms = 1000.0 / args.fps.max(1.0);
    let scroll_at = args.frames / 2;
    let mut idle_rendered = 0;
    for frame in 0..args.frames {
        if frame == scroll_at {
            viewport.scroll_by(0.0, VIEWPORT_H);
            debug!("Scrolled viewport at frame {}", frame);
        }
        clock.advance(frame_ms);
        let report = manager.tick();
        if let Some(action) = report.pressure {
            warn!("Frame {}: memory pressure -> {:?}", frame, action);
        }
        let deadline = ClockDeadline::new(clock.as_ref(), frame_ms / 2.0);
        idle_rendered += manager.idle(&deadline);
    }

    let services = manager.services();
    let summary = json!({
        "frames": args.frames,
        "global": manager.get_global_stats(),
        "pool": services.pool.get_stats(),
        "cache": services.cache.snapshot(),
        "batch": services.renderer.get_stats(),
        "memory": services.memory.get_stats(),
        "workers": services.workers.get_stats(),
        "engine": {
            "loads": engine_stats.loads(),
            "renders": engine_stats.renders(),
        },
        "idle_rendered": idle_rendered,
        "performance_warnings": warnings.load(Ordering::Relaxed),
        "load_failures": failures.load(Ordering::Relaxed),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    manager.shutdown();
    info!("Lottie Orchestra finished");
    Ok(())
}
