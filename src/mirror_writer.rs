// src/mirror_writer.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Atomic writer that uploads to the local store and the remote at once.
//!
//! Chunks go to the inner writer as they arrive and are buffered for the
//! remote. The empty end-of-stream chunk flushes the buffer as one PUT.
//! `complete` commits locally first; a remote failure after that point is
//! reported as [`MirrorError::Indeterminate`] and nothing is rolled back.
//! Preconditions given to `complete` travel with the PUT when it has not
//! been flushed yet. A local refusal after the PUT was applied remotely is
//! indeterminate as well, with the remote as the committed side.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{MirrorError, Result};
use crate::http::transport::{Headers, Verb, header_value};
use crate::mirror_request::{MirrorRequest, RemoteTarget};
use crate::mirror_store::MirrorContext;
use crate::reconcile::completion_attrs;
use crate::sal::{CompleteParams, Object, Writer, WriterParams};
use crate::sink::{DiscardSink, PendingWriteBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Prepared,
    Accumulating,
    Flushed,
    Completed,
    Failed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct MirrorWriter {
    next: Box<dyn Writer>,
    head: Box<dyn Object>,
    params: WriterParams,
    ctx: Arc<MirrorContext>,
    request: Option<MirrorRequest>,
    pending: PendingWriteBuffer,
    object_size: u64,
    state: WriterState,
}

impl MirrorWriter {
    pub fn new(next: Box<dyn Writer>, head: Box<dyn Object>, params: WriterParams, ctx: Arc<MirrorContext>) -> Self {
        Self {
            next,
            head,
            params,
            ctx,
            request: None,
            pending: PendingWriteBuffer::new(),
            object_size: 0,
            state: WriterState::Created,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// The object handle the upload was opened for.
    pub fn head(&self) -> &dyn Object {
        self.head.as_ref()
    }

    /// Bytes buffered for the remote and not yet flushed.
    pub fn pending_len(&self) -> u64 {
        self.pending.len()
    }

    fn refuse(&self, phase: &str) -> MirrorError {
        MirrorError::Lifecycle(format!("{phase} on writer for {} in state {}", self.head.name(), self.state))
    }

    fn fail(&mut self, err: MirrorError) -> MirrorError {
        self.state = WriterState::Failed;
        if let Some(request) = self.request.as_mut() {
            request.abort();
        }
        err
    }

    fn build_request(&self) -> Result<MirrorRequest> {
        let bucket = self.head.bucket().ok_or_else(|| {
            MirrorError::InvalidRequest(format!("object {} is not in a bucket", self.head.name()))
        })?;
        let owner = if bucket.owner.id.is_empty() { &self.params.owner } else { &bucket.owner };
        let creds = self.ctx.owner_credentials(owner)?;

        let mut request = self.ctx.new_request();
        request.init(
            Verb::Put,
            RemoteTarget::object(bucket.key.qualified_name(), self.head.name()),
            &creds,
            Headers::new(),
            Some(self.head.attrs()),
        )?;
        Ok(request)
    }

    /// Carry the caller's preconditions on a PUT that has not gone out yet.
    fn forward_conditions(&mut self, params: &CompleteParams) -> Result<()> {
        let Some(request) = self.request.as_mut() else {
            return Ok(());
        };
        if let Some(want) = &params.if_match {
            request.set_header("if-match", want.as_str())?;
        }
        if let Some(avoid) = &params.if_nomatch {
            request.set_header("if-none-match", avoid.as_str())?;
        }
        Ok(())
    }

    /// The local commit was refused after the PUT went out. The remote
    /// outcome decides whether the sides still agree.
    async fn local_failed_after_flush(&mut self, err: MirrorError) -> MirrorError {
        self.state = WriterState::Failed;
        let Some(request) = self.request.as_mut() else {
            return err;
        };
        match request.complete(&mut DiscardSink::default()).await {
            Err(remote @ MirrorError::RemoteProtocol { .. }) => {
                debug!("{} refused on both sides: {remote}", self.head.name());
                err
            }
            Ok(()) => {
                warn!("{} applied on the remote but refused locally: {err}", self.head.name());
                err.after_remote_commit()
            }
            Err(remote) => {
                warn!("{} refused locally, remote outcome unknown: {remote}", self.head.name());
                err.after_remote_commit()
            }
        }
    }

    /// Attach the buffered payload and send the PUT.
    async fn flush(&mut self) -> Result<()> {
        let Some(request) = self.request.as_mut() else {
            return Err(self.refuse("flush"));
        };
        let len = self.pending.len();
        let body = self.pending.take();
        let sent = async {
            request.set_content_length(len)?;
            request.set_body(body)?;
            request.send().await
        }
        .await;
        if let Err(e) = sent {
            return Err(self.fail(e));
        }
        self.object_size = len;
        self.state = WriterState::Flushed;
        debug!("flushed {} bytes of {} to remote", len, self.head.name());
        Ok(())
    }
}

#[async_trait]
impl Writer for MirrorWriter {
    async fn prepare(&mut self) -> Result<()> {
        if self.state != WriterState::Created {
            return Err(self.refuse("prepare"));
        }
        if let Err(e) = self.next.prepare().await {
            return Err(self.fail(e));
        }
        match self.build_request() {
            Ok(request) => self.request = Some(request),
            Err(e) => return Err(self.fail(e)),
        }
        self.state = WriterState::Prepared;
        Ok(())
    }

    async fn process(&mut self, data: Bytes, offset: u64) -> Result<()> {
        if !matches!(self.state, WriterState::Prepared | WriterState::Accumulating) {
            return Err(self.refuse("process"));
        }
        if let Err(e) = self.next.process(data.clone(), offset).await {
            return Err(self.fail(e));
        }
        if data.is_empty() {
            return self.flush().await;
        }
        self.pending.append(&data, offset);
        self.state = WriterState::Accumulating;
        Ok(())
    }

    async fn complete(&mut self, params: CompleteParams) -> Result<()> {
        match self.state {
            WriterState::Prepared | WriterState::Accumulating => {
                if let Err(e) = self.forward_conditions(&params) {
                    return Err(self.fail(e));
                }
                self.flush().await?
            }
            WriterState::Flushed => {}
            _ => return Err(self.refuse("complete")),
        }

        if let Err(e) = self.next.complete(params.clone()).await {
            return Err(self.local_failed_after_flush(e).await);
        }

        let Some(request) = self.request.as_mut() else {
            return Err(self.fail(MirrorError::Lifecycle("flushed writer has no request".into())));
        };
        if let Err(e) = request.complete(&mut DiscardSink::default()).await {
            warn!("{} committed locally but remote upload failed: {e}", self.head.name());
            self.state = WriterState::Failed;
            return Err(e.after_local_commit());
        }

        let remote_etag = header_value(request.response_headers(), "etag").map(str::to_string);
        let meta = completion_attrs(self.head.key(), &params, self.object_size, remote_etag.as_deref());
        let mut attrs = self.head.attrs().clone();
        attrs.extend(meta);
        self.head.set_attrs(attrs);

        self.ctx.object_mirrored();
        self.state = WriterState::Completed;
        debug!("upload of {} complete on both sides", self.head.name());
        Ok(())
    }
}
