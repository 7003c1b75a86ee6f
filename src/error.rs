use thiserror::Error;

use crate::layer::LayerName;

/// Engine-level failures surfaced to the embedding application.
///
/// Cache misses are never errors; see `LayerError` for the backend taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("{layer} layer failed to initialize: {source}")]
    LayerInit {
        layer: LayerName,
        #[source]
        source: LayerError,
    },
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn layer_init(layer: LayerName, source: LayerError) -> Self {
        Self::LayerInit { layer, source }
    }
}

/// Backend faults raised by a storage layer.
///
/// A miss is a normal `Ok(None)` result and never appears here. The
/// coordinator catches every variant at the layer boundary, logs it, and
/// degrades the operation to a miss or no-op.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("remote cache fault: {message}")]
    Remote { message: String },
    #[error("{layer} backend fault: {message}")]
    Backend { layer: LayerName, message: String },
}

impl LayerError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn backend(layer: LayerName, message: impl Into<String>) -> Self {
        Self::Backend {
            layer,
            message: message.into(),
        }
    }
}
