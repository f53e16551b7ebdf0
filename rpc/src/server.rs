//! Server end of the channel: routes request frames to registered handlers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::{
    CodecError, DEFAULT_MAX_FRAME_BYTES, Frame, FrameKind, FrameReader, FrameWriter, encode,
};
use crate::method::MethodId;
use crate::status::RpcError;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

pub type HandlerFut = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFut + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |payload| -> HandlerFut { Box::pin(f(payload)) })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("handler panicked")
}

/// Encode a response, replacing one that cannot be encoded with an error frame
/// for the same request so the caller is answered and the stream survives.
fn encode_response(frame: &Frame, max_frame_bytes: usize) -> Option<Vec<u8>> {
    match encode(frame, max_frame_bytes) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            tracing::warn!(
                method = frame.method_id,
                request_id = frame.request_id,
                "RPC response not sendable: {error}"
            );
            let fallback = Frame::error(frame, &RpcError::from(error));
            encode(&fallback, max_frame_bytes)
                .inspect_err(|e| tracing::warn!("RPC error frame not sendable: {e}"))
                .ok()
        }
    }
}

pub struct RpcServer {
    handlers: HashMap<MethodId, Handler>,
    max_frame_bytes: usize,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn register(&mut self, method: MethodId, handler: Handler) {
        if self.handlers.insert(method, handler).is_some() {
            tracing::warn!(%method, "RPC handler re-registered; replacing previous handler");
        }
    }

    fn route(&self, frame: &Frame) -> Result<Handler, RpcError> {
        let method = frame.method().ok_or_else(|| {
            RpcError::unimplemented(format!("unknown method id {}", frame.method_id))
        })?;
        method.descriptor().validate(&frame.payload)?;
        self.handlers
            .get(&method)
            .cloned()
            .ok_or_else(|| RpcError::unimplemented(format!("no handler for {method}")))
    }

    /// Run `handler`, folding errors and panics into an error frame.
    async fn invoke(handler: Handler, request: Frame) -> Frame {
        let payload = request.payload.clone();
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload)));
        let outcome = match call {
            Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(RpcError::internal(panic_message(panic.as_ref()))),
            },
            Err(panic) => Err(RpcError::internal(panic_message(panic.as_ref()))),
        };
        match outcome {
            Ok(payload) => Frame::ok(&request, payload),
            Err(error) => {
                tracing::warn!(
                    method = request.method_id,
                    request_id = request.request_id,
                    code = %error.code,
                    "RPC handler failed: {}",
                    error.message
                );
                Frame::error(&request, &error)
            }
        }
    }

    /// Answer one request frame.
    pub async fn dispatch(&self, request: Frame) -> Frame {
        match self.route(&request) {
            Ok(handler) => Self::invoke(handler, request).await,
            Err(error) => Frame::error(&request, &error),
        }
    }

    /// Serve requests until the peer closes the stream.
    ///
    /// Each request runs as its own task, so responses go out in completion
    /// order rather than arrival order.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (response_tx, mut response_rx) = mpsc::channel::<Frame>(RESPONSE_CHANNEL_CAPACITY);
        let max_frame_bytes = self.max_frame_bytes;
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer, max_frame_bytes);
            while let Some(frame) = response_rx.recv().await {
                let Some(bytes) = encode_response(&frame, max_frame_bytes) else {
                    continue;
                };
                if let Err(e) = writer.write_encoded(&bytes).await {
                    tracing::warn!("RPC server write error: {e}");
                    break;
                }
            }
        });

        let mut reader = FrameReader::new(reader, self.max_frame_bytes);
        let outcome = loop {
            match reader.read_frame().await {
                Ok(Some(frame)) if frame.kind == FrameKind::Request => {
                    let tx = response_tx.clone();
                    match self.route(&frame) {
                        Ok(handler) => {
                            tokio::spawn(async move {
                                let response = Self::invoke(handler, frame).await;
                                let _ = tx.send(response).await;
                            });
                        }
                        Err(error) => {
                            let _ = tx.send(Frame::error(&frame, &error)).await;
                        }
                    }
                }
                Ok(Some(frame)) => {
                    tracing::trace!(request_id = frame.request_id, "Ignoring response frame on server side");
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    tracing::warn!("RPC server reader error: {e}");
                    break Err(e);
                }
            }
        };

        drop(response_tx);
        let _ = writer_handle.await;
        outcome
    }
}
