pub mod activity;
pub mod backend;
pub mod library;
pub mod scheduler;
pub mod settings;

use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use activity::ActivityTracker;
use backend::sim::SimulatedBackend;
use scheduler::engine::{Engine, EngineError, EngineHandle};
use settings::Settings;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Assemble and run the broadcast engine until shutdown or a fatal error
/// (an input pool with nothing eligible to play).
pub fn run() -> Result<(), EngineError> {
    let input_root = PathBuf::from(env_or("INPUT_BASE_DIR", "/media"));
    let presets_path = PathBuf::from(env_or("PRESETS_FILE", "/metadata/presets.json"));
    let activity_path = PathBuf::from(env_or("LAST_ACTIVITY_FILE", "last-activity.txt"));

    let presets = settings::load_presets(&presets_path);
    let preset = settings::active_preset(&presets);
    let settings = Settings::from_preset(&preset, &input_root);

    std::fs::create_dir_all(&settings.input_dir)?;

    // The engine is a single-threaded cooperative system; one thread runs
    // the whole program.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle::new(control_tx);

        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, shutting down");
                shutdown_handle.shutdown();
            }
        });

        let build_delay = Duration::from_millis(settings.subgraph_build_ms / 2);
        let backend = SimulatedBackend::new(backend_tx, build_delay);
        let engine = Engine::new(
            backend,
            settings,
            ActivityTracker::new(&activity_path),
            StdRng::from_entropy(),
        );

        log::info!("clipcaster engine starting (media under {})", input_root.display());
        engine.run(backend_rx, control_rx).await
    })
}
