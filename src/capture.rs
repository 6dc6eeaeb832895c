//! Exclusive access to the capture device used for meter readings.
//!
//! At most one [`CaptureHandle`] exists at a time. Dropping the handle
//! releases the device on every exit path, including early returns and
//! panics in the code holding it.

use crate::error::{Result, SupportDeskError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answers whether the user has allowed device access.
pub trait CapturePermission: Send + Sync {
    fn is_granted(&self) -> bool;
}

/// Permission source for platforms without a prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl CapturePermission for AlwaysGranted {
    fn is_granted(&self) -> bool {
        true
    }
}

pub struct CaptureGate {
    active: Arc<AtomicBool>,
    permission: Arc<dyn CapturePermission>,
}

impl CaptureGate {
    pub fn new(permission: Arc<dyn CapturePermission>) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            permission,
        }
    }

    pub fn unrestricted() -> Self {
        Self::new(Arc::new(AlwaysGranted))
    }

    /// Take the device. Fails fast with `CaptureBusy` while another handle
    /// is alive; never waits.
    pub fn acquire(&self) -> Result<CaptureHandle> {
        if !self.permission.is_granted() {
            return Err(SupportDeskError::PermissionDenied(
                "capture device access was refused".to_string(),
            ));
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SupportDeskError::CaptureBusy);
        }
        tracing::debug!("[CAPTURE] device acquired");
        Ok(CaptureHandle {
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Scoped ownership of the capture device.
pub struct CaptureHandle {
    active: Arc<AtomicBool>,
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        tracing::debug!("[CAPTURE] device released");
    }
}
