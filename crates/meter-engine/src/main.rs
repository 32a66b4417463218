//! meterd - network measurement and accounting daemon

use std::sync::atomic::Ordering;

use meter_dataplane::{NullSource, PacketSource, PcapFileSource, SampleAll};
use meter_engine::{control, DaemonConfig, Engine, PidFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("meterd v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/etc/meterd/config.json".into());
    let config = DaemonConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::warn!(path = %config_path, "config not found, using defaults");
        DaemonConfig::default()
    });

    // single instance per host
    let _pidlock = match PidFile::acquire(&config.state_dir) {
        Ok(lock) => lock,
        Err(e @ meter_common::MeterError::AlreadyRunning(_)) => {
            eprintln!("meterd: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("meterd: {e}");
            std::process::exit(1);
        }
    };

    let source: Box<dyn PacketSource> = match &config.trace {
        Some(path) => {
            tracing::info!(trace = %path.display(), "replaying trace file");
            match PcapFileSource::open(path) {
                Ok(src) => Box::new(src),
                Err(e) => {
                    eprintln!("meterd: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => Box::new(NullSource),
    };

    let mut engine = Engine::new(config.engine.clone(), source, Box::new(SampleAll));

    // rules loaded at startup
    for file in &config.rule_files {
        let content = std::fs::read_to_string(file)?;
        let rules: Vec<meter_common::Rule> = serde_json::from_str(&content)?;
        for rule in rules {
            let ident = rule.ident();
            match engine.add_task(rule) {
                Ok(uid) => tracing::info!(uid, ident = %ident, "rule loaded from file"),
                Err(e) => tracing::error!(ident = %ident, error = %e, "rule rejected"),
            }
        }
    }

    let handle = engine.control_handle();
    let stop = engine.running_flag();
    let listen = config.control_listen.clone();

    // control channel and signal handling live on the async runtime; the
    // packet path stays on plain threads
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.spawn(async move {
        if let Err(e) = control::serve(&listen, handle).await {
            tracing::error!(error = %e, "control channel failed");
        }
    });
    runtime.spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        stop.store(false, Ordering::Release);
    });

    engine.run()?;
    Ok(())
}
