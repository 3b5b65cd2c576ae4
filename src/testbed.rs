//! Composition root: builds and wires the kernel, registry, broadcaster and
//! observer transport once at startup.

use crate::broadcast::Broadcaster;
use crate::config::{ConfigError, CvtConfig, KernelConfig, PROPAGATOR_FIXED, PROPAGATOR_KEPLER_TLE};
use crate::kernel::{KernelStatus, SimulationKernel};
use crate::propagator::{FixedPositionProvider, KeplerPropagator, PositionProvider, ProviderError, Tle, TleError};
use crate::registry::ConnectionRegistry;
use crate::transport;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid TLE: {0}")]
    Tle(#[from] TleError),
    #[error("position provider setup failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Testbed {
    kernel: Arc<SimulationKernel>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
}

impl Testbed {
    pub fn new(config: KernelConfig, provider: Arc<dyn PositionProvider>, send_timeout: Duration) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), send_timeout));
        let kernel = Arc::new(SimulationKernel::new(config, provider, Arc::clone(&broadcaster)));
        Self {
            kernel,
            registry,
            broadcaster,
        }
    }

    /// Build from validated configuration, choosing the configured propagator.
    pub fn from_config(config: &CvtConfig) -> Result<Self, TestbedError> {
        config.validate()?;
        let provider = build_provider(config)?;
        Ok(Self::new(config.kernel_config()?, provider, config.server.send_timeout()))
    }

    pub fn kernel(&self) -> &Arc<SimulationKernel> {
        &self.kernel
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn status(&self) -> KernelStatus {
        self.kernel.status()
    }

    pub async fn start(&self) {
        self.kernel.start().await;
    }

    pub async fn stop(&self) {
        self.kernel.stop().await;
    }

    /// Bind the observer listener and serve it on a background task.
    pub async fn listen(&self, addr: &str) -> Result<(SocketAddr, JoinHandle<()>), TestbedError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let handle = tokio::spawn(transport::serve(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.kernel),
        ));
        Ok((local, handle))
    }
}

fn build_provider(config: &CvtConfig) -> Result<Arc<dyn PositionProvider>, TestbedError> {
    match config.simulation.orbit_propagator.as_str() {
        PROPAGATOR_FIXED => {
            info!("Using fixed position provider");
            Ok(Arc::new(FixedPositionProvider::default()))
        }
        PROPAGATOR_KEPLER_TLE => {
            let tle = Tle::parse(&config.tle.name, &config.tle.line1, &config.tle.line2)?;
            Ok(Arc::new(KeplerPropagator::from_tle(&tle)?))
        }
        other => Err(ConfigError::Invalid {
            field: "simulation.orbit_propagator",
            reason: format!("unknown propagator {:?}", other),
        }
        .into()),
    }
}
