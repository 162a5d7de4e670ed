use lib_hostlink::BridgeResult;
use lib_hostlink::collaborators::{StaticTarget, TargetSupplier};
use lib_hostlink::configs::HostlinkConfig;
use lib_hostlink::connections::ConnectionManager;
use lib_hostlink::core::{Correlator, Demultiplexer};
use lib_hostlink::ingestors::{CaptureSource, IngestionPipeline, install_push_hook};
use std::sync::Arc;

/// Everything one daemon run shares between its tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HostlinkConfig>,
    pub manager: Arc<ConnectionManager>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl AppState {
    /// Wires correlator, demultiplexer, connection manager and pipeline.
    pub fn new(config: HostlinkConfig) -> Self {
        let correlator = Arc::new(Correlator::new(config.correlator_config()));
        let demux = Arc::new(Demultiplexer::new(config.demux_config(), Arc::clone(&correlator)));
        let pipeline = IngestionPipeline::new(config.pipeline_config(), Arc::clone(&correlator));
        demux.set_push_sink(pipeline.push_sender());
        let manager = ConnectionManager::new(config.connection_config(), correlator, demux);

        Self {
            config: Arc::new(config),
            manager,
            pipeline,
        }
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        self.manager.correlator()
    }

    fn target(&self) -> StaticTarget {
        StaticTarget(self.config.connection.target.clone().unwrap_or_default())
    }

    pub async fn connect(&self) -> BridgeResult<()> {
        self.manager.connect_with(&self.target()).await
    }

    pub async fn reconnect(&self) -> BridgeResult<()> {
        let target = self.target().target()?;
        self.manager.reconnect(&target).await
    }

    /// Installs the push hook on a fresh connection. Failure leaves ingestion
    /// to the scan pollers, so it is logged rather than returned.
    pub async fn prepare_session(&self) {
        match install_push_hook(self.correlator().as_ref(), self.manager.demux().config()).await {
            Ok(status) => log::info!("Push capture ready ({})", status),
            Err(e) => log::warn!("Push hook not installed, relying on scans: {}", e),
        }
    }

    /// Starts every poller the configuration allows and returns their sources.
    pub fn start_pollers(&self) -> BridgeResult<Vec<CaptureSource>> {
        let mut started = Vec::new();
        for source in CaptureSource::ALL {
            if source == CaptureSource::StructuredScan && self.config.ingestion.scan_channel.is_none() {
                log::info!("No scan channel configured; {} poller disabled", source);
                continue;
            }
            let interval = self.config.poll_interval(source);
            self.pipeline.start_polling(source, interval)?;
            log::info!("Started {} poller every {:?}", source, interval);
            started.push(source);
        }
        Ok(started)
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        self.manager.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn structured_poller_needs_scan_channel() {
        let app = AppState::new(HostlinkConfig::default());
        let started = app.start_pollers().unwrap();
        assert_eq!(started, [CaptureSource::Push, CaptureSource::RenderedScan]);
        assert!(!app.pipeline.is_polling(CaptureSource::StructuredScan));
        app.shutdown();
    }

    #[tokio::test]
    async fn connect_without_target_is_a_config_error() {
        let app = AppState::new(HostlinkConfig::default());
        assert!(matches!(app.connect().await, Err(lib_hostlink::BridgeError::Config(_))));
        assert!(!app.manager.is_connected());
    }
}
