//! Cluster-backed transport (kube-rs, current kubeconfig context).

use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vink_core::{FilterOptions, NamespaceName, ResourceType, WireEnvelope};

use crate::{ListWatch, PointLookup, TransportError, TransportResult, WireStream};

#[derive(Clone)]
pub struct KubeTransport {
    client: kube::Client,
    buffer: usize,
}

impl KubeTransport {
    pub fn new(client: kube::Client, buffer: usize) -> Self { Self { client, buffer: buffer.max(1) } }

    /// Connect using the current kubeconfig context (or in-cluster config).
    pub async fn connect(buffer: usize) -> anyhow::Result<Self> {
        let t0 = Instant::now();
        let client = kube::Client::try_default().await?;
        info!(took_ms = %t0.elapsed().as_millis(), "transport: kube client ready");
        Ok(Self::new(client, buffer))
    }

    pub fn client(&self) -> kube::Client { self.client.clone() }
}

fn map_err(e: anyhow::Error) -> TransportError {
    match e.downcast_ref::<kube::Error>() {
        Some(kube::Error::Api(resp)) => TransportError::Server { code: resp.code, message: resp.message.clone() },
        Some(kube::Error::SerdeError(se)) => TransportError::Decode(se.to_string()),
        _ => TransportError::Unavailable(format!("{:#}", e)),
    }
}

#[async_trait::async_trait]
impl ListWatch for KubeTransport {
    async fn list_watch(&self, resource: ResourceType, options: &FilterOptions, cancel: CancellationToken) -> TransportResult<WireStream> {
        // Resolve up front so an unserved type fails the open instead of the stream.
        vink_kubehub::api_resource(self.client.clone(), resource).await.map_err(map_err)?;
        let (tx, rx) = mpsc::channel::<TransportResult<WireEnvelope>>(self.buffer);
        let (env_tx, mut env_rx) = mpsc::channel::<WireEnvelope>(self.buffer);
        let client = self.client.clone();
        let opts = options.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let watch = vink_kubehub::start_watcher(client, resource, &opts, env_tx);
            futures::pin_mut!(watch);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(resource = %resource, "transport: watch canceled");
                        return;
                    }
                    env = env_rx.recv() => match env {
                        Some(env) => { if tx.send(Ok(env)).await.is_err() { return; } }
                        None => return,
                    },
                    res = &mut watch => {
                        // Flush what the watcher queued before it returned.
                        while let Ok(env) = env_rx.try_recv() { if tx.send(Ok(env)).await.is_err() { return; } }
                        if let Err(e) = res {
                            warn!(resource = %resource, error = %e, "transport: watch failed");
                            let _ = tx.send(Err(map_err(e))).await;
                        }
                        return;
                    }
                }
            }
        });
        let stream = futures::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = rx.recv() => item.map(|i| (i, (rx, cancel))),
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait::async_trait]
impl PointLookup for KubeTransport {
    async fn lookup(&self, resource: ResourceType, identities: &[NamespaceName], cancel: CancellationToken) -> TransportResult<Vec<String>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            res = vink_kubehub::get_many(self.client.clone(), resource, identities) => res.map_err(map_err),
        }
    }
}
