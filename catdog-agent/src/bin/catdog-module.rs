/**
 * CATDOG MODULE - Processus hôte d'un module
 *
 * RÔLE : Instancie le driver demandé via le registre, le fait booter, le
 * raccorde au canal global puis le fait tourner jusqu'à SIGTERM / Ctrl-C.
 *
 * CODES DE SORTIE : 0 arrêt propre, 1 crash en fonctionnement,
 * 2 invocation invalide (module inconnu, params), 3 échec du boot.
 */

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use catdog_agent::launcher::join_global_channel;
use catdog_agent::signals::{init_tracing, shutdown_signal};
use catdog_agent::supervisor::{ENV_HEARTBEAT_INTERVAL_MS, ENV_MODULE_NAME, ENV_RELAY_ADDR};
use catdog_agent::ModuleRegistry;
use catdog_core::{LogSink, MessageSink, ModuleRuntime, HEARTBEAT_INTERVAL};
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};

const EXIT_CRASH: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_BOOT: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "catdog-module", version, about = "Run one catdog module")]
struct Cli {
    /// Registry id, e.g. debug.dummy_sensor
    #[arg(long)]
    module: String,

    /// Driver parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,

    /// Instance name used in heartbeats (defaults to the module id)
    #[arg(long, env = ENV_MODULE_NAME)]
    name: Option<String>,

    /// Global channel address; heartbeats are only logged without it
    #[arg(long, env = ENV_RELAY_ADDR)]
    relay: Option<String>,

    #[arg(long, env = ENV_HEARTBEAT_INTERVAL_MS)]
    heartbeat_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let registry = ModuleRegistry::with_builtin();
    let params: Value = match serde_json::from_str(&cli.params) {
        Ok(params) => params,
        Err(e) => {
            error!(module = %cli.module, error = %e, "--params is not valid JSON");
            return ExitCode::from(EXIT_INVALID);
        }
    };
    let driver = match registry.create(&cli.module, params) {
        Ok(driver) => driver,
        Err(e) => {
            error!(module = %cli.module, error = %e, known = ?registry.ids(), "cannot create module");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    let name = cli.name.clone().unwrap_or_else(|| cli.module.clone());
    let every = cli
        .heartbeat_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(HEARTBEAT_INTERVAL);
    let mut runtime = ModuleRuntime::new(name.clone(), driver).with_heartbeat_interval(every);

    // Boot avant toute connexion au relay
    if let Err(e) = runtime.boot().await {
        error!(module = %name, error = %e, "boot failed");
        return ExitCode::from(EXIT_BOOT);
    }

    let (sink, relay): (Arc<dyn MessageSink>, _) = match &cli.relay {
        Some(addr) => {
            let (sink, client) = join_global_channel(runtime.context(), addr);
            (sink, Some(client))
        }
        None => {
            warn!(module = %name, "no relay configured, heartbeats are only logged");
            (Arc::new(LogSink), None)
        }
    };

    let stop = runtime.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("stop requested");
        stop.stop();
    });

    let outcome = runtime.run(sink).await;
    if let Some(relay) = relay {
        relay.join().await;
    }

    match outcome {
        Ok(()) => {
            info!(module = %name, "module stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(module = %name, error = %e, "module crashed");
            ExitCode::from(EXIT_CRASH)
        }
    }
}
