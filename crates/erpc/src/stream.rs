// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream resources: bounded buffers and the manager that binds stream ids
//! to their local ends.
//!
//! A [`StreamBuffer`] is a fixed-capacity ring with separate producer and
//! consumer wait queues. A full buffer suspends `push`; an empty-but-open
//! buffer suspends `pop`; `finish` drains gracefully; `destroy` rejects all
//! waiters. When a consumer is already waiting, `push` hands the chunk off
//! directly and the ring is bypassed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use meshkit_core::{JsonValue, WireError};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::node::Outbound;
use crate::proto::ControlMessage;

type PopWaiter = oneshot::Sender<Result<Option<JsonValue>, WireError>>;

struct BufState {
    queue: VecDeque<JsonValue>,
    capacity: usize,
    finished: bool,
    error: Option<WireError>,
    pop_waiters: VecDeque<PopWaiter>,
}

pub struct StreamBuffer {
    state: Mutex<BufState>,
    writable: Notify,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufState {
                queue: VecDeque::new(),
                capacity,
                finished: false,
                error: None,
                pop_waiters: VecDeque::new(),
            }),
            writable: Notify::new(),
        }
    }

    /// Enqueues one chunk, suspending while the ring is full.
    ///
    /// # Errors
    ///
    /// Fails once the buffer is finished or destroyed.
    pub async fn push(&self, chunk: JsonValue) -> Result<(), WireError> {
        let mut pending = chunk;
        loop {
            // Register for the wakeup before inspecting state, so a consumer
            // freeing a slot in between cannot be missed.
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_push(pending)? {
                None => return Ok(()),
                Some(back) => pending = back,
            }
            notified.await;
        }
    }

    /// `Ok(None)` means the ring is full and the chunk is handed back.
    fn try_push(&self, chunk: JsonValue) -> Result<Option<JsonValue>, WireError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        if state.finished {
            return Err(WireError::buffer_closed("stream already finished"));
        }
        // Direct hand-off: a waiting consumer bypasses the ring entirely.
        let mut pending = chunk;
        while let Some(waiter) = state.pop_waiters.pop_front() {
            match waiter.send(Ok(Some(pending))) {
                Ok(()) => return Ok(None),
                Err(Ok(Some(back))) => pending = back,
                Err(_) => return Ok(None),
            }
        }
        if state.queue.len() < state.capacity {
            state.queue.push_back(pending);
            return Ok(None);
        }
        Ok(Some(pending))
    }

    /// Next chunk; `Ok(None)` once finished and drained.
    ///
    /// # Errors
    ///
    /// Fails with the destroy reason after queued chunks have drained.
    pub async fn pop(&self) -> Result<Option<JsonValue>, WireError> {
        let waiter = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(chunk) = state.queue.pop_front() {
                // One slot freed: wake one suspended producer.
                self.writable.notify_one();
                return Ok(Some(chunk));
            }
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.finished {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            state.pop_waiters.push_back(tx);
            rx
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(WireError::buffer_closed("stream buffer dropped")))
    }

    /// Graceful end: queued chunks stay readable, waiting consumers see the
    /// end, suspended producers fail.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.finished = true;
        // Consumers only wait while the queue is empty, so they observe the
        // end immediately.
        for waiter in state.pop_waiters.drain(..) {
            let _ = waiter.send(Ok(None));
        }
        drop(state);
        self.writable.notify_waiters();
    }

    /// Failure end: every waiter is rejected with `reason`; chunks already
    /// queued are still delivered before the reason surfaces.
    pub fn destroy(&self, reason: WireError) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.error.is_none() {
            state.error = Some(reason.clone());
        }
        for waiter in state.pop_waiters.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
        drop(state);
        self.writable.notify_waiters();
    }
}

/// The consuming end of a stream.
#[derive(Clone)]
pub struct StreamReader {
    buffer: Arc<StreamBuffer>,
}

impl StreamReader {
    /// Next chunk; `Ok(None)` at a graceful end.
    ///
    /// # Errors
    ///
    /// Fails with the stream's abort reason.
    pub async fn next(&self) -> Result<Option<JsonValue>, WireError> {
        self.buffer.pop().await
    }
}

#[derive(Clone)]
enum WriterInner {
    Local(Arc<StreamBuffer>),
    Remote { stream_id: Uuid, outbound: Outbound },
}

/// The producing end of a stream. Either local (backed by a buffer in this
/// process) or a proxy for a buffer owned by a remote peer.
#[derive(Clone)]
pub struct StreamWriter {
    inner: WriterInner,
}

impl StreamWriter {
    pub(crate) fn remote(stream_id: Uuid, outbound: Outbound) -> Self {
        Self { inner: WriterInner::Remote { stream_id, outbound } }
    }

    /// The backing buffer, when the writer end lives in this process.
    pub(crate) fn as_local(&self) -> Option<Arc<StreamBuffer>> {
        match &self.inner {
            WriterInner::Local(buffer) => Some(Arc::clone(buffer)),
            WriterInner::Remote { .. } => None,
        }
    }

    /// Pushes one chunk, suspending under local backpressure.
    ///
    /// # Errors
    ///
    /// Fails once the stream ended or the connection is gone.
    pub async fn push(&self, chunk: JsonValue) -> Result<(), WireError> {
        match &self.inner {
            WriterInner::Local(buffer) => buffer.push(chunk).await,
            WriterInner::Remote { stream_id, outbound } => outbound
                .send(ControlMessage::StreamData { stream_id: *stream_id, chunk })
                .map_err(|_| WireError::channel_closed("connection gone")),
        }
    }

    /// Gracefully ends the stream.
    pub fn finish(&self) {
        match &self.inner {
            WriterInner::Local(buffer) => buffer.finish(),
            WriterInner::Remote { stream_id, outbound } => {
                let _ = outbound.send(ControlMessage::StreamEnd { stream_id: *stream_id });
            }
        }
    }

    /// Ends the stream with a failure.
    pub fn abort(&self, reason: WireError) {
        match &self.inner {
            WriterInner::Local(buffer) => buffer.destroy(reason),
            WriterInner::Remote { stream_id, outbound } => {
                let _ = outbound.send(ControlMessage::StreamAbort { stream_id: *stream_id, reason });
            }
        }
    }
}

/// Creates a connected writer/reader pair over one bounded buffer.
pub fn pipe(capacity: usize) -> (StreamWriter, StreamReader) {
    let buffer = Arc::new(StreamBuffer::new(capacity));
    (
        StreamWriter { inner: WriterInner::Local(Arc::clone(&buffer)) },
        StreamReader { buffer },
    )
}

/// Binds stream ids to their local buffer ends and pumps outgoing readers.
pub(crate) struct StreamManager {
    outbound: Outbound,
    capacity: usize,
    incoming: Mutex<HashMap<Uuid, Arc<StreamBuffer>>>,
    shutdown: CancellationToken,
}

impl StreamManager {
    pub fn new(outbound: Outbound, capacity: usize) -> Self {
        Self {
            outbound,
            capacity,
            incoming: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a buffer that incoming `stream-data` for `stream_id` will
    /// be pushed into, returning the reader end.
    pub fn register_incoming(&self, stream_id: Uuid) -> StreamReader {
        let buffer = Arc::new(StreamBuffer::new(self.capacity));
        self.incoming
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stream_id, Arc::clone(&buffer));
        StreamReader { buffer }
    }

    /// Routes incoming chunks for a stream whose writer end lives here.
    pub fn bind_incoming_buffer(&self, stream_id: Uuid, buffer: Arc<StreamBuffer>) {
        self.incoming
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stream_id, buffer);
    }

    /// Pumps `reader` to the peer as `stream-data` messages until it ends.
    pub fn register_outgoing(&self, stream_id: Uuid, reader: StreamReader) {
        let outbound = self.outbound.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    item = reader.next() => match item {
                        Ok(Some(chunk)) => {
                            if outbound.send(ControlMessage::StreamData { stream_id, chunk }).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = outbound.send(ControlMessage::StreamEnd { stream_id });
                            break;
                        }
                        Err(reason) => {
                            let _ = outbound.send(ControlMessage::StreamAbort { stream_id, reason });
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Delivers one incoming chunk. Suspends while the destination buffer is
    /// full, which is what propagates backpressure onto the control channel.
    pub async fn deliver(&self, stream_id: Uuid, chunk: JsonValue) {
        let buffer = {
            let incoming = self.incoming.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            incoming.get(&stream_id).cloned()
        };
        match buffer {
            Some(buffer) => {
                if let Err(error) = buffer.push(chunk).await {
                    debug!(%stream_id, %error, "dropping chunk for ended stream");
                }
            }
            None => debug!(%stream_id, "dropping chunk for unknown stream"),
        }
    }

    pub fn end(&self, stream_id: Uuid) {
        let removed = self
            .incoming
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&stream_id);
        match removed {
            Some(buffer) => buffer.finish(),
            None => debug!(%stream_id, "stream-end for unknown stream"),
        }
    }

    pub fn abort(&self, stream_id: Uuid, reason: WireError) {
        let removed = self
            .incoming
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&stream_id);
        match removed {
            Some(buffer) => buffer.destroy(reason),
            None => debug!(%stream_id, "stream-abort for unknown stream"),
        }
    }

    /// Fails every registered buffer and stops every pump.
    pub fn close_all(&self, reason: &WireError) {
        self.shutdown.cancel();
        let drained: Vec<Arc<StreamBuffer>> = self
            .incoming
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, buffer)| buffer)
            .collect();
        for buffer in drained {
            buffer.destroy(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_buffer_suspends_push_until_pop() {
        let (writer, reader) = pipe(1);
        writer.push(serde_json::json!(1)).await.expect("fits");

        let writer2 = writer.clone();
        let second = tokio::spawn(async move { writer2.push(serde_json::json!(2)).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "push past capacity must suspend");

        assert_eq!(reader.next().await.expect("ok"), Some(serde_json::json!(1)));
        second.await.expect("join").expect("resumes after pop");
        assert_eq!(reader.next().await.expect("ok"), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn waiting_consumer_gets_direct_handoff() {
        let (writer, reader) = pipe(4);
        let pop = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        writer.push(serde_json::json!("direct")).await.expect("push");
        assert_eq!(pop.await.expect("join").expect("ok"), Some(serde_json::json!("direct")));
    }

    #[tokio::test]
    async fn finish_drains_then_ends() {
        let (writer, reader) = pipe(4);
        writer.push(serde_json::json!(1)).await.expect("push");
        writer.finish();

        assert_eq!(reader.next().await.expect("ok"), Some(serde_json::json!(1)));
        assert_eq!(reader.next().await.expect("ok"), None);
        let err = writer.push(serde_json::json!(2)).await.expect_err("finished");
        assert!(matches!(err, WireError::BufferClosed { .. }));
    }

    #[tokio::test]
    async fn destroy_delivers_queued_then_fails() {
        let (writer, reader) = pipe(4);
        writer.push(serde_json::json!(1)).await.expect("push");
        writer.abort(WireError::channel_closed("torn down"));

        assert_eq!(reader.next().await.expect("queued survives"), Some(serde_json::json!(1)));
        let err = reader.next().await.expect_err("then the reason surfaces");
        assert_eq!(err, WireError::channel_closed("torn down"));
    }

    #[tokio::test]
    async fn destroy_rejects_waiting_consumers() {
        let (writer, reader) = pipe(4);
        let pop = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        writer.abort(WireError::channel_closed("gone"));
        let err = pop.await.expect("join").expect_err("rejected");
        assert_eq!(err, WireError::channel_closed("gone"));
    }
}
