use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use computeflow_core::computation::builtin::{Forward, GeneratorSource, RecordCounter, total_count};
use computeflow_core::{MemoryLogManager, Settings, StreamProcessor, Topology};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod server;
mod setup_tracing;

const ENV_METRICS_PORT: &str = "COMPUTEFLOW_METRICS_PORT";
const ENV_RECORDS: &str = "COMPUTEFLOW_RECORDS";
const DEFAULT_METRICS_PORT: u16 = 2469;
const DEFAULT_RECORDS: u64 = 1000;

const OUTPUT_STREAM: &str = "output";
const ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");
    Ok(())
}

enum Completion {
    Counted(u64),
    Signal,
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::from_env()?;
    let records = env_or(ENV_RECORDS, DEFAULT_RECORDS)?;
    let port = env_or(ENV_METRICS_PORT, DEFAULT_METRICS_PORT)?;

    let cln_token = CancellationToken::new();
    let state = server::ServerState::default();
    let server_handle = tokio::spawn(server::start_metrics_server(
        SocketAddr::from(([0, 0, 0, 0], port)),
        state.clone(),
        cln_token.clone(),
    ));

    let manager = MemoryLogManager::new();
    let mut processor = StreamProcessor::init(manager.clone(), demo_topology(records)?, &settings).await?;
    processor.start().await?;
    if processor.wait_for_assignments(ASSIGNMENT_TIMEOUT).await {
        state.set_ready(true);
    } else {
        warn!(timeout = ?ASSIGNMENT_TIMEOUT, "Processor not assigned, running anyway");
    }

    let completion = tokio::select! {
        _ = shutdown_signal() => Completion::Signal,
        counted = wait_for_output(&manager, records) => Completion::Counted(counted),
    };
    state.set_ready(false);
    match completion {
        Completion::Counted(counted) => {
            info!(counted, low_watermark = %processor.low_watermark(), "All records counted, draining");
            if !processor.drain_and_stop(DRAIN_TIMEOUT).await {
                warn!(timeout = ?DRAIN_TIMEOUT, "Drain incomplete");
            }
        }
        Completion::Signal => {
            if !processor.stop(STOP_TIMEOUT).await {
                warn!(timeout = ?STOP_TIMEOUT, "Stop incomplete");
            }
        }
    }

    cln_token.cancel();
    server_handle.await??;
    Ok(())
}

/// GENERATOR --(s1)--> C1 --(s2)--> COUNTER --(output)
fn demo_topology(records: u64) -> computeflow_core::Result<Topology> {
    Topology::builder()
        .add_computation(
            GeneratorSource::supplier("GENERATOR", records, 100, Duration::from_millis(10)),
            &["o1:s1"],
        )
        .add_computation(Forward::supplier("C1", 1), &["i1:s1", "o1:s2"])
        .add_computation(
            RecordCounter::supplier("COUNTER", 1, Duration::from_millis(100)),
            &["i1:s2", "o1:output"],
        )
        .build()
}

async fn wait_for_output(manager: &MemoryLogManager, records: u64) -> u64 {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        ticker.tick().await;
        let counted = total_count(&manager.records(OUTPUT_STREAM));
        if counted >= records {
            return counted;
        }
        info!(counted, records, "Progress");
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| format!("Invalid value {value:?} for {name}: {e}").into()),
        Err(_) => Ok(default),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_topology() {
        let topology = demo_topology(10).unwrap();
        assert_eq!(topology.roots(), vec!["GENERATOR"]);
        assert_eq!(topology.streams(), vec!["output", "s1", "s2"]);
    }

    #[test]
    fn test_env_or() {
        assert_eq!(env_or("COMPUTEFLOW_TEST_UNSET_VARIABLE", 42u64).unwrap(), 42);
    }
}
