// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The download coordinator.

Downloads stream to disk with incremental SHA-256 verification. Requests for
the same destination path are deduplicated: exactly one transfer runs and
every caller shares its outcome. Colliding requests must agree on checksum
(or, lacking one, on URL); disagreement is a hard error because it means two
call sites believe different content belongs at one path.
*/

use {
    crate::{
        error::{DebmillError, Result},
        io::{decompress_file, Compression},
        runtime::Runtime,
    },
    digest::Digest,
    futures::StreamExt,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tokio::{io::AsyncWriteExt, sync::watch},
    tracing::debug,
    url::Url,
};

/// One file to download.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: Url,

    /// Absolute destination path.
    pub destination: PathBuf,

    /// Optional hex SHA-256 enforced while writing.
    pub checksum: Option<String>,
}

/// Failure outcome shared between deduplicated waiters.
#[derive(Clone, Debug)]
struct Failure {
    kind: FailureKind,
    message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FailureKind {
    Transport,
    Integrity,
    Cancelled,
}

type Outcome = std::result::Result<u64, Failure>;

struct Inflight {
    url: Url,
    checksum: Option<String>,
    rx: watch::Receiver<Option<Outcome>>,
}

/// Coordinates parallel downloads over the shared [Runtime].
pub struct Downloader {
    runtime: Arc<Runtime>,
    inflight: Mutex<HashMap<PathBuf, Inflight>>,
}

impl Downloader {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Download one file, deduplicating against in-flight requests for the
    /// same destination. Resolves to the byte count written.
    pub async fn fetch(&self, request: DownloadRequest) -> Result<u64> {
        enum Role {
            Perform(watch::Sender<Option<Outcome>>),
            Wait(watch::Receiver<Option<Outcome>>),
        }

        let role = {
            let mut inflight = self.inflight.lock().expect("inflight map lock");

            if let Some(existing) = inflight.get(&request.destination) {
                // Colliding requests must agree on what belongs at the path.
                if let Some(checksum) = &request.checksum {
                    if existing.checksum.as_deref() != Some(checksum.as_str()) {
                        return Err(DebmillError::DownloadConflict {
                            destination: request.destination.display().to_string(),
                            message: format!(
                                "existing download expects {:?}, new request expects {}",
                                existing.checksum, checksum
                            ),
                        });
                    }
                } else if existing.url != request.url {
                    return Err(DebmillError::DownloadConflict {
                        destination: request.destination.display().to_string(),
                        message: format!(
                            "existing download from {}, new request from {}",
                            existing.url, request.url
                        ),
                    });
                }

                Role::Wait(existing.rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(
                    request.destination.clone(),
                    Inflight {
                        url: request.url.clone(),
                        checksum: request.checksum.clone(),
                        rx,
                    },
                );
                Role::Perform(tx)
            }
        };

        match role {
            Role::Wait(mut rx) => {
                let outcome = loop {
                    if let Some(outcome) = rx.borrow().clone() {
                        break outcome;
                    }
                    if rx.changed().await.is_err() {
                        let current = rx.borrow().clone();
                        break current.unwrap_or(Err(Failure {
                            kind: FailureKind::Cancelled,
                            message: "download aborted before completion".to_string(),
                        }));
                    }
                };

                self.map_outcome(&request, outcome)
            }
            Role::Perform(tx) => {
                let outcome = self.perform(&request).await;

                // Publish before clearing the in-flight entry so late joiners
                // either see the result or start a fresh download.
                let _ = tx.send(Some(outcome.clone()));
                self.inflight
                    .lock()
                    .expect("inflight map lock")
                    .remove(&request.destination);

                self.map_outcome(&request, outcome)
            }
        }
    }

    /// Download several files; siblings run to completion and the first
    /// failure is reported.
    pub async fn fetch_all(&self, requests: Vec<DownloadRequest>) -> Result<Vec<u64>> {
        let results =
            futures::future::join_all(requests.into_iter().map(|request| self.fetch(request)))
                .await;

        results.into_iter().collect()
    }

    /// Download a compressed file and decompress it in place, returning the
    /// decompressed path. The destination must carry a known compression
    /// extension; decompression runs under the compression limit so CPU work
    /// does not starve transfers.
    pub async fn fetch_and_decompress(&self, request: DownloadRequest) -> Result<PathBuf> {
        let filename = request
            .destination
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or_default();

        if Compression::from_filename(filename) == Compression::None {
            return Err(DebmillError::NotCompressed(
                request.destination.display().to_string(),
            ));
        }

        let destination = request.destination.clone();
        self.fetch(request).await?;

        let _permit = self.runtime.acquire_compression().await;
        decompress_file(&destination).await
    }

    /// Decompress an already-downloaded file under the compression limit.
    pub async fn decompress(&self, path: &Path) -> Result<PathBuf> {
        let _permit = self.runtime.acquire_compression().await;
        decompress_file(path).await
    }

    fn map_outcome(&self, request: &DownloadRequest, outcome: Outcome) -> Result<u64> {
        match outcome {
            Ok(size) => Ok(size),
            Err(failure) => Err(match failure.kind {
                FailureKind::Integrity => DebmillError::DigestMismatch {
                    path: request.destination.display().to_string(),
                    expected: request.checksum.clone().unwrap_or_default(),
                    actual: failure.message,
                },
                FailureKind::Cancelled => DebmillError::Cancelled,
                FailureKind::Transport => DebmillError::Download {
                    url: request.url.to_string(),
                    message: failure.message,
                },
            }),
        }
    }

    async fn perform(&self, request: &DownloadRequest) -> Outcome {
        let transport = |message: String| Failure {
            kind: FailureKind::Transport,
            message,
        };

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transport(format!("creating {}: {}", parent.display(), e)))?;
        }

        let _permit = self.runtime.acquire_download().await;
        let cancel = self.runtime.cancel_token();

        if cancel.is_cancelled() {
            return Err(Failure {
                kind: FailureKind::Cancelled,
                message: "cancelled before start".to_string(),
            });
        }

        let response = self
            .runtime
            .http()
            .get(request.url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| transport(format!("{:?}", e)))?;

        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(&request.destination)
            .await
            .map_err(|e| transport(format!("creating {}: {}", request.destination.display(), e)))?;

        let mut hasher = request.checksum.as_ref().map(|_| sha2::Sha256::new());
        let mut written = 0u64;

        let outcome: Outcome = loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(Failure {
                        kind: FailureKind::Cancelled,
                        message: "cancelled mid-transfer".to_string(),
                    });
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                None => break Ok(written),
                Some(Err(e)) => break Err(transport(format!("{:?}", e))),
                Some(Ok(bytes)) => {
                    if let Some(hasher) = hasher.as_mut() {
                        hasher.update(&bytes);
                    }
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(transport(format!(
                            "writing {}: {}",
                            request.destination.display(),
                            e
                        )));
                    }
                    written += bytes.len() as u64;
                }
            }
        };

        let outcome = outcome.and_then(|written| {
            if let (Some(hasher), Some(expected)) = (hasher, &request.checksum) {
                let actual = hex::encode(hasher.finalize());
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(Failure {
                        kind: FailureKind::Integrity,
                        message: actual,
                    });
                }
            }
            Ok(written)
        });

        match outcome {
            Ok(written) => {
                let _ = file.flush().await;
                debug!(
                    file = %request.destination.display(),
                    bytes = written,
                    "downloaded"
                );
                Ok(written)
            }
            Err(failure) => {
                // Never leave partial content behind.
                drop(file);
                let _ = tokio::fs::remove_file(&request.destination).await;
                Err(failure)
            }
        }
    }
}
