// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Process-wide shared resources.

The only process singletons are gathered here and passed explicitly: the HTTP
client, the bounded download and compression limits, the hardlink mutex that
closes the unlink-then-link TOCTOU race, and the cancellation token fanned
out to every task.
*/

use {
    crate::error::Result,
    std::sync::{Arc, Mutex, MutexGuard},
    tokio::sync::Semaphore,
    tokio_util::sync::CancellationToken,
};

/// Width of one nested fan-out: how many sibling tasks a single coordination
/// level runs concurrently. Actual I/O and CPU concurrency are bounded by the
/// download and compression limits, so nesting depth cannot starve siblings.
pub const SUBGROUP_WIDTH: usize = 10;

/// Tunables for [Runtime] construction.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// HTTP request timeout in seconds.
    pub http_timeout: u64,

    /// Custom User-Agent header, if any.
    pub user_agent: Option<String>,

    /// Concurrent HTTP downloads.
    pub download_workers: usize,

    /// Concurrent (de)compression operations.
    pub compression_workers: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            http_timeout: 300,
            user_agent: None,
            download_workers: 20,
            compression_workers: std::thread::available_parallelism()
                .map(|v| v.get())
                .unwrap_or(4),
        }
    }
}

/// Shared process state, constructed once at startup.
pub struct Runtime {
    http: reqwest::Client,
    download_limit: Arc<Semaphore>,
    compression_limit: Arc<Semaphore>,
    hardlink_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Runtime {
    pub fn new(options: &RuntimeOptions) -> Result<Arc<Self>> {
        let mut builder =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(options.http_timeout));

        if let Some(user_agent) = &options.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Arc::new(Self {
            http: builder.build()?,
            download_limit: Arc::new(Semaphore::new(options.download_workers.max(1))),
            compression_limit: Arc::new(Semaphore::new(options.compression_workers.max(1))),
            hardlink_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// The cancellation token observed by every blocking primitive.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of all in-flight work.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Acquire a download slot.
    pub async fn acquire_download(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.download_limit
            .acquire()
            .await
            .expect("download semaphore never closed")
    }

    /// Acquire a (de)compression slot.
    pub async fn acquire_compression(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.compression_limit
            .acquire()
            .await
            .expect("compression semaphore never closed")
    }

    /// Hold the process-wide hardlink lock.
    pub fn hardlink_guard(&self) -> MutexGuard<'_, ()> {
        self.hardlink_lock.lock().expect("hardlink lock poisoned")
    }
}
