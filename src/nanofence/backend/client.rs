/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::types::{BackendNode, BackendVolume, VolumeKey};
use crate::nanofence::logger::{log_info, log_warn};
use crate::nanofence::observability::metrics;
use reqwest::{Client, StatusCode, Url};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "backend";

pub type BackendFuture<T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send>>;

/// Read-only view of the storage backend consumed by the fencing core.
pub trait BackendClient: Send + Sync {
    fn list_nodes(&self) -> BackendFuture<Vec<BackendNode>>;

    fn get_volume(&self, key: &VolumeKey) -> BackendFuture<BackendVolume>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unavailable(String),
    Timeout(Duration),
    Status { code: u16, message: String },
    NotFound(String),
    Decode(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unavailable(msg) => write!(f, "storage backend unavailable: {msg}"),
            BackendError::Timeout(after) => write!(
                f,
                "storage backend call timed out after {}",
                humantime::format_duration(*after)
            ),
            BackendError::Status { code, message } => {
                write!(f, "storage backend returned {code}: {message}")
            }
            BackendError::NotFound(what) => write!(f, "{what} not found in storage backend"),
            BackendError::Decode(msg) => write!(f, "invalid storage backend response: {msg}"),
        }
    }
}

impl Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// REST client for the storage backend management API.
pub struct HttpBackendClient {
    client: Client,
    endpoint: Url,
}

impl HttpBackendClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BackendError> {
        let endpoint = Url::parse(endpoint.trim_end_matches('/')).map_err(|err| {
            BackendError::Unavailable(format!("invalid backend endpoint '{endpoint}': {err}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Unavailable(format!(
                    "backend endpoint '{}' cannot be a base URL",
                    self.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch<T>(client: Client, url: Url, subject: String) -> Result<T, BackendError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(subject));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text.trim().to_string()
            };
            return Err(BackendError::Status {
                code: status.as_u16(),
                message,
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| BackendError::Decode(err.to_string()))
    }
}

impl BackendClient for HttpBackendClient {
    fn list_nodes(&self) -> BackendFuture<Vec<BackendNode>> {
        let client = self.client.clone();
        let url = self.url(&["v1", "nodes"]);
        Box::pin(async move {
            Self::fetch::<Vec<BackendNode>>(client, url?, "node list".to_string()).await
        })
    }

    fn get_volume(&self, key: &VolumeKey) -> BackendFuture<BackendVolume> {
        let client = self.client.clone();
        let url = self.url(&[
            "v1",
            "namespaces",
            key.namespace.as_str(),
            "volumes",
            key.name.as_str(),
        ]);
        let subject = format!("volume {key}");
        Box::pin(async move { Self::fetch::<BackendVolume>(client, url?, subject).await })
    }
}

pub type BackendFactory =
    Arc<dyn Fn() -> Result<Arc<dyn BackendClient>, BackendError> + Send + Sync>;

struct HandleInner {
    client: RwLock<Arc<dyn BackendClient>>,
    factory: BackendFactory,
    call_timeout: Duration,
}

/// Shared, recyclable access to the active backend client.
///
/// Every call is bounded by the handle's call timeout. `reset` replaces the
/// active client with a fresh one from the factory; calls already in flight
/// keep the client they started with.
#[derive(Clone)]
pub struct BackendHandle {
    inner: Arc<HandleInner>,
}

impl BackendHandle {
    pub fn new(factory: BackendFactory, call_timeout: Duration) -> Result<Self, BackendError> {
        let client = factory()?;
        Ok(Self {
            inner: Arc::new(HandleInner {
                client: RwLock::new(client),
                factory,
                call_timeout,
            }),
        })
    }

    /// Handle over a fixed client. Resets hand back the same instance.
    pub fn from_client(client: Arc<dyn BackendClient>, call_timeout: Duration) -> Self {
        let shared = Arc::clone(&client);
        let factory: BackendFactory = Arc::new(move || Ok(Arc::clone(&shared)));
        Self {
            inner: Arc::new(HandleInner {
                client: RwLock::new(client),
                factory,
                call_timeout,
            }),
        }
    }

    pub fn http(endpoint: &str, call_timeout: Duration) -> Result<Self, BackendError> {
        let endpoint = endpoint.to_string();
        let factory: BackendFactory = Arc::new(move || {
            let client = HttpBackendClient::new(&endpoint, call_timeout)?;
            Ok(Arc::new(client) as Arc<dyn BackendClient>)
        });
        Self::new(factory, call_timeout)
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    fn current(&self) -> Arc<dyn BackendClient> {
        let guard = self
            .inner
            .client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub async fn list_nodes(&self) -> Result<Vec<BackendNode>, BackendError> {
        let future = self.current().list_nodes();
        self.bounded(future).await
    }

    pub async fn get_volume(&self, key: &VolumeKey) -> Result<BackendVolume, BackendError> {
        let future = self.current().get_volume(key);
        self.bounded(future).await
    }

    async fn bounded<T>(&self, future: BackendFuture<T>) -> Result<T, BackendError> {
        let limit = self.inner.call_timeout;
        match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    /// Rebuilds the active client. On factory failure the previous client
    /// stays in place.
    pub fn reset(&self) -> Result<(), BackendError> {
        let fresh = (self.inner.factory)()?;
        let mut guard = self
            .inner
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = fresh;
        metrics::record_backend_reset();
        Ok(())
    }
}

/// Recycles the backend client whenever a reset is requested on `requests`.
/// Requests that pile up while a reset runs collapse into one.
pub fn spawn_reset_listener(
    handle: BackendHandle,
    mut requests: mpsc::Receiver<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    while requests.try_recv().is_ok() {}
                    match handle.reset() {
                        Ok(()) => log_info(COMPONENT, "Recycled storage backend client", &[]),
                        Err(err) => {
                            let error = err.to_string();
                            log_warn(
                                COMPONENT,
                                "Failed to recycle storage backend client",
                                &[("error", error.as_str())],
                            );
                        }
                    }
                }
            }
        }
    })
}
