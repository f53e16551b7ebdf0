//! Client end of the channel.
//!
//! A writer task owns the outgoing half of the transport and a reader task owns
//! the incoming half. Calls are correlated with responses solely by request id,
//! so responses may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{DEFAULT_MAX_FRAME_BYTES, Frame, FrameKind, FrameReader, FrameWriter, encode};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::method::MethodId;
use crate::status::{RpcError, StatusCode};

const WRITER_CHANNEL_CAPACITY: usize = 64;

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Frame>>>>;

#[derive(Clone)]
pub struct ClientConfig {
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            interceptors: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("call_timeout", &self.call_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides the client's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    late_responses: AtomicU64,
}

/// Point-in-time copy of the channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelMetricsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub late_responses: u64,
    pub in_flight: usize,
}

pub struct RpcClient {
    writer_tx: mpsc::Sender<Vec<u8>>,
    max_frame_bytes: usize,
    pending: Pending,
    next_id: AtomicU32,
    chain: InterceptorChain,
    call_timeout: Duration,
    metrics: Arc<ChannelMetrics>,
    closed: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RpcClient {
    /// Start the reader and writer tasks on the current runtime.
    pub fn connect<R, W>(reader: R, writer: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let metrics = Arc::new(ChannelMetrics::default());
        let closed = Arc::new(AtomicBool::new(false));

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let writer_closed = Arc::clone(&closed);
        let max_frame_bytes = config.max_frame_bytes;
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer, max_frame_bytes);
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = writer.write_encoded(&bytes).await {
                    tracing::warn!("RPC write error: {e}");
                    writer_closed.store(true, Ordering::Release);
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_metrics = Arc::clone(&metrics);
        let reader_closed = Arc::clone(&closed);
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader, max_frame_bytes);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_response(frame, &reader_pending, &reader_metrics).await;
                    }
                    Ok(None) => {
                        tracing::debug!("RPC peer closed the channel");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("RPC reader error: {e}");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            // Dropping the senders wakes every waiting call with UNAVAILABLE.
            reader_pending.lock().await.clear();
        });

        Self {
            writer_tx,
            max_frame_bytes,
            pending,
            next_id: AtomicU32::new(1),
            chain: InterceptorChain::new(config.interceptors),
            call_timeout: config.call_timeout,
            metrics,
            closed,
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_response(frame: Frame, pending: &Pending, metrics: &ChannelMetrics) {
        if frame.kind != FrameKind::Response {
            tracing::trace!(request_id = frame.request_id, "Ignoring request frame on client side");
            return;
        }
        let sender = pending.lock().await.remove(&frame.request_id);
        let request_id = frame.request_id;
        let delivered = match sender {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !delivered {
            metrics.late_responses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(request_id, "Discarding late response for a resolved call");
        }
    }

    /// Issue one call and wait for its response, the timeout, or channel loss.
    pub async fn call(
        &self,
        method: MethodId,
        payload: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.round_trip(method, payload, options).await;
        if let Err(error) = &result {
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%method, code = %error.code, "RPC call failed");
        }
        result
    }

    async fn round_trip(
        &self,
        method: MethodId,
        payload: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::unavailable("channel closed"));
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = Frame::request(method, request_id, payload);
        self.chain.outgoing(&mut frame);
        // Encoding here keeps an unencodable frame from reaching the writer
        // task, which treats every write error as a broken transport.
        let bytes = encode(&frame, self.max_frame_bytes)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        // The reader marks the channel closed before draining `pending`, so a
        // registration that raced the drain is caught here.
        if self.is_closed() {
            self.pending.lock().await.remove(&request_id);
            return Err(RpcError::unavailable("channel closed"));
        }

        if self.writer_tx.send(bytes).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(RpcError::unavailable("writer channel closed"));
        }

        let timeout = options.timeout.unwrap_or(self.call_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(mut response)) => {
                self.chain.incoming(&mut response);
                response.into_result()
            }
            Ok(Err(_)) => Err(RpcError::unavailable("channel closed before response")),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(RpcError::new(
                    StatusCode::DeadlineExceeded,
                    format!("{method} did not answer within {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn metrics(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            calls: self.metrics.calls.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            timeouts: self.metrics.timeouts.load(Ordering::Relaxed),
            late_responses: self.metrics.late_responses.load(Ordering::Relaxed),
            in_flight: self.pending.lock().await.len(),
        }
    }

    #[must_use]
    pub fn interceptor_names(&self) -> Vec<String> {
        self.chain.names()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
