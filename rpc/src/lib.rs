//! Binary-framed request/response channel.
//!
//! A closed set of methods ([`MethodId`]) travels between an [`RpcClient`] and
//! an [`RpcServer`] over any async byte stream. Frames correlate by request id,
//! failures come back as structured [`RpcError`]s with a [`StatusCode`], and
//! client-side [`Interceptor`]s see every frame in both directions.

pub mod codec;

mod client;
mod interceptor;
mod method;
mod server;
mod status;

pub use client::{CallOptions, ChannelMetricsSnapshot, ClientConfig, RpcClient};
pub use codec::{CodecError, DEFAULT_MAX_FRAME_BYTES, Frame, FrameKind};
pub use interceptor::{Interceptor, TracingInterceptor};
pub use method::{MethodDescriptor, MethodId};
pub use server::{Handler, HandlerFut, RpcServer, handler};
pub use status::{RpcError, StatusCode};
