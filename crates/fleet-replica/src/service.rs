//! # service
//!
//! why: one transport-agnostic implementation of the replica's rpc surface
//! relations: wraps the router, replicator, event bus and archive storage; served by any transport
//! what: ReplicaService (dispatch, watch, upload, deploy, cancel, restart, info), Watch stream, archive seams

use crate::bus::{EventBus, Observer};
use crate::deploy::{DeploymentReplicator, Info};
use crate::dispatch::Dispatcher;
use crate::wal::history::HistoryTranscoder;
use async_trait::async_trait;
use fleet_core::message::{next_id, now_millis};
use fleet_core::{Archive, DeployOptions, Error, Message, Peer, Result};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-call context: credentials and the caller's cancellation.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub token: Option<String>,
    pub cancel: CancellationToken,
}

impl Call {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), ..Self::default() }
    }
}

/// Where uploaded archives are kept.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    async fn new_upload(&self, deployment_id: &str, size: u64) -> Result<Box<dyn Uploader>>;
}

#[async_trait]
pub trait Uploader: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Commit the upload and return its location.
    async fn finish(self: Box<Self>) -> Result<String>;

    async fn abort(self: Box<Self>);
}

pub struct ReplicaService {
    local: Peer,
    token: Option<String>,
    dispatcher: Arc<dyn Dispatcher>,
    replicator: Arc<DeploymentReplicator>,
    history: Arc<HistoryTranscoder>,
    bus: Arc<EventBus>,
    archives: Arc<dyn ArchiveStorage>,
    uploads: Arc<Semaphore>,
}

impl ReplicaService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Peer,
        token: Option<String>,
        dispatcher: Arc<dyn Dispatcher>,
        replicator: Arc<DeploymentReplicator>,
        history: Arc<HistoryTranscoder>,
        bus: Arc<EventBus>,
        archives: Arc<dyn ArchiveStorage>,
        max_uploads: usize,
    ) -> Self {
        Self {
            local,
            token,
            dispatcher,
            replicator,
            history,
            bus,
            archives,
            uploads: Arc::new(Semaphore::new(max_uploads)),
        }
    }

    fn authorize(&self, call: &Call) -> Result<()> {
        match &self.token {
            Some(expected) if call.token.as_deref() != Some(expected.as_str()) => {
                Err(Error::PermissionDenied("invalid token".into()))
            }
            _ => Ok(()),
        }
    }

    pub async fn dispatch(&self, call: &Call, messages: Vec<Message>) -> Result<()> {
        self.authorize(call)?;
        if messages.is_empty() {
            return Err(Error::Malformed("no messages to dispatch".into()));
        }

        tokio::select! {
            _ = call.cancel.cancelled() => Err(Error::Cancelled),
            result = self.dispatcher.dispatch(messages) => result,
        }
    }

    /// Subscribe to applied messages, starting with a replay of recent history.
    pub fn watch(&self, call: &Call) -> Result<Watch> {
        self.authorize(call)?;

        // register before reading history so nothing falls in between
        let observer = self.bus.register();
        let history = Message::history(self.local.clone(), self.history.replay());
        Ok(Watch { history: Some(history), observer, cancel: call.cancel.clone() })
    }

    /// Stream an archive into storage and describe it.
    pub async fn upload<S>(&self, call: &Call, initiator: &str, size: u64, mut chunks: S) -> Result<Archive>
    where
        S: Stream<Item = Vec<u8>> + Unpin + Send,
    {
        self.authorize(call)?;
        let _permit = Arc::clone(&self.uploads)
            .try_acquire_owned()
            .map_err(|_| Error::ResourceExhausted("too many concurrent uploads".into()))?;

        let deployment_id = format!("{}-{:x}", self.local.name, next_id());
        let mut uploader = self.archives.new_upload(&deployment_id, size).await?;
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = call.cancel.cancelled() => {
                    uploader.abort().await;
                    return Err(Error::Cancelled);
                }
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            if let Err(e) = uploader.write(&chunk).await {
                uploader.abort().await;
                return Err(e);
            }
        }

        if bytes == 0 {
            uploader.abort().await;
            return Err(Error::Malformed("empty upload".into()));
        }

        let location = uploader.finish().await?;
        let archive = Archive {
            deployment_id,
            checksum: hex::encode(hasher.finalize()),
            location,
            bytes,
            initiator: initiator.to_string(),
            peer: Some(self.local.clone()),
            ts: now_millis(),
        };
        tracing::info!(deployment = %archive.deployment_id, bytes, checksum = %archive.checksum, "archive uploaded");

        let notice = Message::log(
            self.local.clone(),
            format!("{} uploaded {} ({} bytes)", initiator, archive.deployment_id, bytes),
        );
        if let Err(e) = self.dispatcher.dispatch(vec![notice]).await {
            tracing::debug!(error = %e, "upload notice not replicated");
        }
        Ok(archive)
    }

    pub async fn deploy(&self, call: &Call, options: DeployOptions, archive: Archive, peers: Vec<Peer>) -> Result<()> {
        self.authorize(call)?;
        self.replicator.deploy(options, archive, peers).await
    }

    pub async fn cancel(&self, call: &Call, initiator: &str) -> Result<()> {
        self.authorize(call)?;
        self.replicator.cancel(initiator).await
    }

    pub async fn restart(&self, call: &Call, initiator: &str) -> Result<()> {
        self.authorize(call)?;
        self.replicator.restart(initiator).await
    }

    pub fn info(&self, call: &Call) -> Result<Info> {
        self.authorize(call)?;
        Ok(self.replicator.status())
    }
}

/// Server-pushed message stream.
pub struct Watch {
    history: Option<Message>,
    observer: Observer,
    cancel: CancellationToken,
}

impl Watch {
    /// Next message, or `None` once cancelled or the bus is gone.
    pub async fn next(&mut self) -> Option<Message> {
        if let Some(history) = self.history.take() {
            return Some(history);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => None,
            message = self.observer.recv() => message,
        }
    }
}
