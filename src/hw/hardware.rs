use std::sync::Arc;

use tracing::info;

use super::adapter::BleAdapter;
use super::btleplug_backend::BtleplugAdapter;
use super::fake_backend::{FakeAdapter, FakeAdapterConfig};
use crate::error::AdapterError;

/// Runtime BLE backend selection.
#[derive(Debug)]
pub enum AdapterBackend {
    Real,
    Fake(FakeAdapterConfig),
}

impl AdapterBackend {
    /// Opens the selected backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the real backend finds no usable adapter.
    pub async fn open(self) -> Result<Arc<dyn BleAdapter>, AdapterError> {
        let adapter: Arc<dyn BleAdapter> = match self {
            Self::Real => Arc::new(BtleplugAdapter::new().await?),
            Self::Fake(config) => {
                info!("using fake BLE backend");
                Arc::new(FakeAdapter::new(config))
            }
        };
        Ok(adapter)
    }
}
