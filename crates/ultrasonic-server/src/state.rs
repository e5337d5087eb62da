use crate::manager::DeviceManager;
use std::sync::Arc;

pub struct AppState {
    pub manager: Arc<DeviceManager>,
}

impl AppState {
    pub fn new(manager: Arc<DeviceManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}
