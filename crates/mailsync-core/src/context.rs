//! Shared collaborators handed to every engine component.

use std::sync::Arc;

use crate::alarm::{AlarmScheduler, TokioAlarms};
use crate::config::EngineConfig;
use crate::display::{LogSink, StatusSink};
use crate::store::Store;
use crate::transport::Connector;

/// Collaborators and configuration shared by the supervisor, workers and
/// schedulers. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    /// Persistent store.
    pub store: Arc<dyn Store>,
    /// Transport session factory.
    pub connector: Arc<dyn Connector>,
    /// Status receiver.
    pub sink: Arc<dyn StatusSink>,
    /// Wake-up scheduler.
    pub alarms: Arc<dyn AlarmScheduler>,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Create a context with default configuration, a logging sink and tokio
    /// alarms.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn Connector>) -> Self {
        Self {
            store,
            connector,
            sink: Arc::new(LogSink),
            alarms: Arc::new(TokioAlarms),
            config: Arc::new(EngineConfig::default()),
        }
    }

    /// Replace the status sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the alarm scheduler.
    #[must_use]
    pub fn with_alarms(mut self, alarms: Arc<dyn AlarmScheduler>) -> Self {
        self.alarms = alarms;
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
