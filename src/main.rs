pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod schema;
pub mod server;
pub mod services {
    pub mod ingest;
    pub mod query;
}

use crate::config::Config;
use crate::db::store::Store;
use crate::server::AppState;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    applied: usize,
}

async fn run(cfg: Config) -> Result<(), String> {
    // 1) Open the reading log and create the schema before taking traffic
    let store = Store::open(&cfg.database_path, cfg.read_pool_size)
        .map_err(|e| format!("Opening {} failed: {}", cfg.database_path.display(), e))?;
    store
        .initialize()
        .map_err(|e| format!("Initialising {} failed: {}", cfg.database_path.display(), e))?;
    let existing = store.count().map_err(|e| format!("Counting readings failed: {}", e))?;
    let last_seen = store
        .recent_readings(1)
        .map_err(|e| format!("Reading latest reading failed: {}", e))?
        .pop()
        .map(|r| r.timestamp)
        .unwrap_or_else(|| "-".to_string());
    info!(
        "Reading store ready at {} ({} reading(s) on record, last at {})",
        store.path().display(),
        existing,
        last_seen
    );

    // 2) Bind the listener
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .map_err(|e| format!("Binding {} failed: {}", cfg.listen_addr, e))?;
    info!("Listening on http://{} (chart field: {})", cfg.listen_addr, cfg.chart_field);

    // 3) Serve until shutdown
    let state = AppState::new(Arc::new(store), cfg.chart_field);
    server::serve(listener, state)
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))?;

    info!("Server stopped");
    Ok(())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => PathBuf::from(
                args.next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            ),
            Some(s) if s.starts_with("--env-file=") => match &s["--env-file=".len()..] {
                "" => return Err("`--env-file` requires a path argument".to_string()),
                p => PathBuf::from(p),
            },
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if env_file.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => (path, true),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };

    let applied = config::load_env_file(&path)?;
    Ok(Some(LoadedEnvFile {
        path,
        explicit,
        applied,
    }))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "sensor-sink {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("fatal: unable to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
