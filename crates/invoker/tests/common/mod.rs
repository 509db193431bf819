//! Loopback provider speaking the invoker's wire protocol.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ares_invoker::{
    EndpointAddr, Error, InvocationRequest, InvocationResponse, ProviderEndpoint, Serialization,
    ServiceDescriptor, WireCodec,
};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Remote application key every test provider is published under.
pub const REMOTE_APP: &str = "remote-app";

/// What the provider does with one request.
pub enum Reply {
    /// Write these responses, in order.
    Respond(Vec<InvocationResponse>),
    /// Read the request and never answer.
    Silent,
    /// Close the connection without answering.
    HangUp,
}

type Handler = dyn Fn(&InvocationRequest) -> Reply + Send + Sync;

/// Reads requests in one serialization and may answer in another.
struct ProviderCodec {
    inbound: WireCodec<InvocationRequest>,
    outbound: WireCodec<InvocationRequest>,
}

impl Decoder for ProviderCodec {
    type Item = InvocationRequest;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inbound.decode(buf)
    }
}

impl Encoder<InvocationResponse> for ProviderCodec {
    type Error = Error;

    fn encode(&mut self, item: InvocationResponse, buf: &mut BytesMut) -> Result<(), Self::Error> {
        self.outbound.encode(item, buf)
    }
}

/// A provider listening on an ephemeral loopback port.
pub struct Provider {
    pub addr: EndpointAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    hang_up: broadcast::Sender<()>,
    acceptor: JoinHandle<()>,
}

impl Provider {
    /// Start a provider that answers with `handler`.
    pub async fn start<F>(serialization: Serialization, handler: F) -> Self
    where
        F: Fn(&InvocationRequest) -> Reply + Send + Sync + 'static,
    {
        Self::start_mismatched(serialization, serialization, handler).await
    }

    /// Start a provider whose replies use `reply_serialization`.
    pub async fn start_mismatched<F>(
        serialization: Serialization,
        reply_serialization: Serialization,
        handler: F,
    ) -> Self
    where
        F: Fn(&InvocationRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = EndpointAddr::from(listener.local_addr().unwrap());
        let handler: Arc<Handler> = Arc::new(handler);
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let (hang_up, _) = broadcast::channel(1);

        let acceptor = {
            let accepted = Arc::clone(&accepted);
            let requests = Arc::clone(&requests);
            let hang_up = hang_up.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let codec = ProviderCodec {
                        inbound: WireCodec::new(serialization),
                        outbound: WireCodec::new(reply_serialization),
                    };
                    let framed = Framed::new(stream, codec);
                    tokio::spawn(serve(
                        framed,
                        Arc::clone(&handler),
                        Arc::clone(&requests),
                        hang_up.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            accepted,
            requests,
            hang_up,
            acceptor,
        }
    }

    /// Start a provider that echoes the first argument back.
    pub async fn echo(serialization: Serialization) -> Self {
        Self::start(serialization, |req| Reply::Respond(vec![echo(req)])).await
    }

    /// Start a provider that never answers.
    pub async fn silent(serialization: Serialization) -> Self {
        Self::start(serialization, |_| Reply::Silent).await
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Requests read so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Close every open connection. New connections are still accepted.
    pub fn hang_up_all(&self) {
        let _ = self.hang_up.send(());
    }

    /// This provider as published for `service`.
    pub fn endpoint(&self, service: &str) -> ProviderEndpoint {
        ProviderEndpoint::new(self.addr.clone(), ServiceDescriptor::new(service))
            .with_app_key(REMOTE_APP)
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.acceptor.abort();
        let _ = self.hang_up.send(());
    }
}

async fn serve(
    mut framed: Framed<tokio::net::TcpStream, ProviderCodec>,
    handler: Arc<Handler>,
    requests: Arc<AtomicUsize>,
    mut hang_up: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = hang_up.recv() => return,
            frame = framed.next() => {
                let Some(Ok(request)) = frame else {
                    return;
                };
                requests.fetch_add(1, Ordering::SeqCst);
                match (*handler)(&request) {
                    Reply::Respond(responses) => {
                        for response in responses {
                            if framed.send(response).await.is_err() {
                                return;
                            }
                        }
                    }
                    Reply::Silent => {}
                    Reply::HangUp => return,
                }
            }
        }
    }
}

/// Success response carrying the request's first argument.
pub fn echo(request: &InvocationRequest) -> InvocationResponse {
    InvocationResponse::success(
        request.correlation_id,
        request.arguments.first().cloned().unwrap_or_default(),
    )
}

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
