//! Client-side middleware over frames.
//!
//! Outgoing requests pass through interceptors in registration order; incoming
//! responses pass through them in reverse.

use std::sync::Arc;

use crate::codec::Frame;

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, _frame: &mut Frame) {}

    fn on_response(&self, _frame: &mut Frame) {}
}

#[derive(Clone, Default)]
pub(crate) struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub(crate) fn outgoing(&self, frame: &mut Frame) {
        for interceptor in &self.interceptors {
            interceptor.on_request(frame);
        }
    }

    pub(crate) fn incoming(&self, frame: &mut Frame) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_response(frame);
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }
}

/// Logs every frame at trace level.
#[derive(Debug, Default)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_request(&self, frame: &mut Frame) {
        tracing::trace!(
            method = frame.method_id,
            request_id = frame.request_id,
            "RPC request"
        );
    }

    fn on_response(&self, frame: &mut Frame) {
        tracing::trace!(
            method = frame.method_id,
            request_id = frame.request_id,
            status = ?frame.status,
            "RPC response"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodId;
    use crate::status::StatusCode;
    use serde_json::{Value, json};

    struct Tag(&'static str);

    fn push(frame: &mut Frame, field: &str, tag: &str) {
        if let Some(list) = frame
            .payload
            .get_mut(field)
            .and_then(Value::as_array_mut)
        {
            list.push(json!(tag));
        }
    }

    impl Interceptor for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn on_request(&self, frame: &mut Frame) {
            push(frame, "out", self.0);
        }

        fn on_response(&self, frame: &mut Frame) {
            push(frame, "in", self.0);
        }
    }

    #[test]
    fn test_out_in_registration_order_back_in_reverse() {
        let chain = InterceptorChain::new(vec![Arc::new(Tag("a")), Arc::new(Tag("b"))]);
        let mut request = Frame::request(MethodId::Ping, 1, json!({"out": [], "in": []}));
        chain.outgoing(&mut request);
        assert_eq!(request.payload["out"], json!(["a", "b"]));

        let mut response = Frame::ok(&request, json!({"in": []}));
        chain.incoming(&mut response);
        assert_eq!(response.payload["in"], json!(["b", "a"]));
        assert_eq!(response.status, Some(StatusCode::Ok));
        assert_eq!(chain.names(), vec!["a", "b"]);
    }
}
