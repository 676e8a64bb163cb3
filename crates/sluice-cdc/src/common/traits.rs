//! Source lifecycle

use crate::common::task::TaskState;
use crate::common::Result;
use async_trait::async_trait;

/// A change data capture source with a start/stop lifecycle.
#[async_trait]
pub trait CdcSource: Send + Sync {
    /// Spawn the background capture loop.
    ///
    /// Fails with an invalid-state error when already running.
    async fn start(&mut self) -> Result<()>;

    /// Signal the capture loop to stop and wait for it to exit.
    async fn stop(&mut self) -> Result<()>;

    /// Running, and the last poll succeeded.
    async fn is_healthy(&self) -> bool;

    fn state(&self) -> TaskState;
}
