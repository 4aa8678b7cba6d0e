//! In-memory transports for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use channelrpc_core::ChannelError;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;

use crate::duplex::{DuplexConnector, DuplexTransport, UpgradeRequest};
use crate::error::TransportError;
use crate::transport::{
    ConnectionSettings, HttpSend, ResponseBody, TransportBody, TransportFactory, full_response_body,
};

type Reply = Result<Response<ResponseBody>, TransportError>;
type Handler = dyn Fn(&Request<Bytes>) -> Reply + Send + Sync;

/// [`HttpSend`] answering from a closure and recording every request.
pub(crate) struct MockTransport {
    handler: Box<Handler>,
    delay: Duration,
    pub(crate) requests: Mutex<Vec<Request<Bytes>>>,
}

impl MockTransport {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Request<Bytes>) -> Reply + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, handler)
    }

    pub(crate) fn with_delay<F>(delay: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&Request<Bytes>) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Reply with `status` and no body.
    pub(crate) fn status(status: StatusCode) -> Arc<Self> {
        Self::new(move |_| {
            let mut response = Response::new(full_response_body(Bytes::new()));
            *response.status_mut() = status;
            Ok(response)
        })
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl HttpSend for Arc<MockTransport> {
    fn send(
        &self,
        request: Request<TransportBody>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, TransportError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.map_err(TransportError::from)?.to_bytes();
            if !this.delay.is_zero() {
                tokio::time::sleep(this.delay).await;
            }
            let request = Request::from_parts(parts, body);
            let response = (this.handler)(&request);
            if let Ok(mut requests) = this.requests.lock() {
                requests.push(request);
            }
            response
        })
    }
}

/// Hands out one shared [`MockTransport`].
pub(crate) struct SharedTransportFactory(pub(crate) Arc<MockTransport>);

impl TransportFactory for SharedTransportFactory {
    fn create(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn HttpSend>, ChannelError> {
        Ok(Arc::new(Arc::clone(&self.0)))
    }
}

/// Counts transports built; each answers `204 No Content`.
#[derive(Default)]
pub(crate) struct CountingTransportFactory {
    pub(crate) created: AtomicUsize,
}

impl TransportFactory for CountingTransportFactory {
    fn create(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn HttpSend>, ChannelError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport::status(StatusCode::NO_CONTENT)))
    }
}

/// Test side of a scripted duplex session.
pub(crate) struct Peer {
    /// Everything the channel wrote, in order. Ends when the channel
    /// closes its output.
    pub(crate) written: mpsc::Receiver<Bytes>,
    /// Bytes for the channel to receive. Dropping it ends the input.
    pub(crate) inbound: Option<mpsc::UnboundedSender<Result<Bytes, ChannelError>>>,
    pub(crate) request: UpgradeRequest,
}

impl Peer {
    pub(crate) fn push(&self, bytes: Bytes) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Ok(bytes));
        }
    }

    pub(crate) fn fail(&self, err: ChannelError) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Err(err));
        }
    }

    /// End the channel's input.
    pub(crate) fn close_input(&mut self) {
        self.inbound = None;
    }

    /// Concatenate everything written until the channel closes its output.
    pub(crate) async fn drain_written(&mut self) -> Bytes {
        let mut out = Vec::new();
        while let Some(chunk) = self.written.next().await {
            out.extend_from_slice(&chunk);
        }
        Bytes::from(out)
    }
}

/// [`DuplexConnector`] backed by in-memory channels.
///
/// Each write yields to the scheduler first, so unsynchronized writers would
/// interleave.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    peers: Mutex<Vec<Peer>>,
    pub(crate) connects: AtomicUsize,
    pub(crate) fail_with: Mutex<Option<ChannelError>>,
}

impl ScriptedConnector {
    /// Peer of the most recent session.
    pub(crate) fn take_peer(&self) -> Option<Peer> {
        self.peers.lock().ok().and_then(|mut peers| peers.pop())
    }
}

impl DuplexConnector for ScriptedConnector {
    fn connect<'a>(
        &'a self,
        request: UpgradeRequest,
        _settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<DuplexTransport, ChannelError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_with.lock().ok().and_then(|mut f| f.take()) {
                return Err(err);
            }
            let (out_tx, out_rx) = mpsc::channel::<Bytes>(1);
            let (in_tx, in_rx) = mpsc::unbounded::<Result<Bytes, ChannelError>>();

            let sink = out_tx
                .sink_map_err(|e| ChannelError::communication(format!("peer went away: {e}")))
                .with(|chunk: Bytes| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, ChannelError>(chunk)
                });

            if let Ok(mut peers) = self.peers.lock() {
                peers.push(Peer {
                    written: out_rx,
                    inbound: Some(in_tx),
                    request,
                });
            }
            Ok(DuplexTransport {
                sink: Box::pin(sink),
                source: Box::pin(in_rx),
                subprotocol: None,
            })
        })
    }
}
