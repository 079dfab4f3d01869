mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod tls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::AcknowledgedMessage,
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    tls::TlsConfig,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Delay for the specified duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
