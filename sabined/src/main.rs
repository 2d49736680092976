//! sabined : le démon du serveur audio Sabine.
//!
//! Charge la configuration, construit le cœur, charge les modules,
//! puis tourne sur la boucle principale jusqu'à SIGINT/SIGTERM ou à
//! la commande EXIT d'un client. L'arrêt décharge tout dans l'ordre
//! inverse des dépendances.

mod config;
mod modules;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sabcore::MemPool;
use sabloop::Mainloop;
use sabmix::Core;
use sabwire::cookie;

use config::DaemonConfig;
use modules::ModuleHost;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = DaemonConfig::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();
    info!("sabined {} starting", env!("CARGO_PKG_VERSION"));

    // Le plan de contrôle vit sur un runtime mono-thread ; chaque
    // sink a son propre thread IO par ailleurs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(config)))
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let cookie_path = config
        .cookie
        .clone()
        .unwrap_or_else(cookie::default_path);
    let auth_cookie = cookie::load_or_create(&cookie_path)?;

    let core = Core::new(MemPool::new(
        sabcore::memblock::DEFAULT_SLAB_SIZE,
        sabcore::memblock::DEFAULT_POOL_SLABS,
    ));

    let exit = CancellationToken::new();
    let host = ModuleHost {
        core: core.clone(),
        cookie: auth_cookie,
        exit: exit.clone(),
    };

    for module_config in &config.modules {
        if let Err(e) = host.load(module_config).await {
            error!("module load failed: {e:#}");
        }
    }

    // Routage de repli imposé par l'environnement.
    if let Ok(name) = std::env::var("SABINE_DEFAULT_SINK") {
        if !name.is_empty() {
            core.set_default_sink(Some(name));
        }
    }
    if let Ok(name) = std::env::var("SABINE_DEFAULT_SOURCE") {
        if !name.is_empty() {
            core.set_default_source(Some(name));
        }
    }

    run_mainloop(&core, exit).await;

    info!("shutting down");
    core.shutdown().await;
    Ok(())
}

/// La boucle principale du démon : signaux UNIX et bilan périodique.
async fn run_mainloop(core: &Arc<Core>, exit: CancellationToken) {
    let mainloop = Mainloop::new();

    let mut signal_handles = Vec::new();
    for signum in [libc::SIGINT, libc::SIGTERM] {
        let ml = mainloop.clone();
        match mainloop.signal_event(signum, move |sig| {
            info!("caught signal {sig}, exiting");
            ml.quit(0);
        }) {
            Ok(handle) => signal_handles.push(handle),
            Err(e) => error!("cannot install handler for signal {signum}: {e}"),
        }
    }

    // Bilan mémoire périodique.
    let stats_core = core.clone();
    let timer = mainloop.timer_event(
        tokio::time::Instant::now() + std::time::Duration::from_secs(60),
        move || {
            let stats = stats_core.pool.stats();
            info!(
                "pool: {} blocks / {} bytes in use, {} blocks total",
                stats.total_allocated(),
                stats.total_size(),
                stats.total_accumulated(),
            );
            Some(tokio::time::Instant::now() + std::time::Duration::from_secs(60))
        },
    );

    tokio::select! {
        code = mainloop.run() => {
            info!("main loop finished with code {code}");
        }
        _ = exit.cancelled() => {
            info!("exit requested by a client");
        }
    }
    drop(timer);
    drop(signal_handles);
}
