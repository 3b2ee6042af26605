// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative shutdown for background delivery workers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shutdown coordinator
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    shutdown_flag: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown_flag),
        }
    }
}

/// Handle for checking shutdown
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
