//! UDP listener: receive datagrams, run requests, reply, drain on shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::coap::{Message, MessageType};
use crate::config::ServerConfig;
use crate::exchanges::{ExchangeCache, Seen};
use crate::pipeline::{panic_message, GatewayResponse, IncomingRequest, Outcome, RequestPipeline};
use crate::proxy::Forward;

/// The CoAP side of the gateway.
pub struct CoapServer<F> {
    socket: Arc<UdpSocket>,
    pipeline: Arc<RequestPipeline<F>>,
    max_datagram_size: usize,
    shutdown_grace: Duration,
    next_message_id: AtomicU16,
    exchanges: Arc<ExchangeCache>,
}

impl<F: Forward> CoapServer<F> {
    /// Bind the listening socket. Failure here is fatal to startup.
    pub async fn bind(config: &ServerConfig, pipeline: Arc<RequestPipeline<F>>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(&config.listen_address).await?;
        let seed = Uuid::new_v4();
        let seed = seed.as_bytes();

        Ok(Self {
            socket: Arc::new(socket),
            pipeline,
            max_datagram_size: config.max_datagram_size,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            next_message_id: AtomicU16::new(u16::from_be_bytes([seed[0], seed[1]])),
            exchanges: Arc::new(ExchangeCache::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tracing::info!(
            address = %self.local_addr()?,
            routes = self.pipeline.registry().len(),
            "aiolos-gateway listening"
        );

        // One extra byte so an oversized datagram is distinguishable from a full one.
        let mut buf = vec![0u8; self.max_datagram_size + 1];
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.dispatch(&buf[..len], peer, &mut tasks).await,
                        Err(e) => tracing::warn!(error = %e, "UDP receive failed"),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Request task failed");
                    }
                }
            }
        }

        self.drain(tasks).await;
        tracing::info!("aiolos-gateway shut down gracefully");
        Ok(())
    }

    async fn dispatch(&self, datagram: &[u8], peer: SocketAddr, tasks: &mut JoinSet<()>) {
        if datagram.len() > self.max_datagram_size {
            tracing::debug!(%peer, max = self.max_datagram_size, "Oversized datagram");
            self.reject_undecodable(datagram, peer).await;
            return;
        }

        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Undecodable datagram");
                self.reject_undecodable(datagram, peer).await;
                return;
            }
        };

        let mtype = message.mtype;
        match mtype {
            MessageType::Acknowledgement | MessageType::Reset => {
                tracing::trace!(%peer, mid = message.message_id, "Ignoring ACK/RST");
            }
            _ if message.code.is_request() => self.admit_request(message, peer, tasks).await,
            MessageType::Confirmable => {
                // Empty CON is a ping; a CON response we never asked for is rejected too.
                tracing::debug!(%peer, mid = message.message_id, code = %message.code, "Answering with RST");
                send(&self.socket, &Message::reset(message.message_id), peer).await;
            }
            MessageType::NonConfirmable => {
                tracing::debug!(%peer, code = %message.code, "Ignoring non-request NON");
            }
        }
    }

    async fn reject_undecodable(&self, datagram: &[u8], peer: SocketAddr) {
        self.pipeline.stats().record_dropped();
        if let Some((MessageType::Confirmable, message_id)) = Message::peek_header(datagram) {
            send(&self.socket, &Message::reset(message_id), peer).await;
        }
    }

    /// Start the request unless `(peer, message id)` was already seen.
    async fn admit_request(&self, message: Message, peer: SocketAddr, tasks: &mut JoinSet<()>) {
        let mid = message.message_id;
        match self.exchanges.begin((peer, mid), Instant::now()) {
            Seen::New => self.spawn_request(message, peer, tasks),
            Seen::InFlight => tracing::debug!(%peer, mid, "Duplicate of a request still in flight"),
            Seen::Completed(Some(reply)) if message.mtype == MessageType::Confirmable => {
                tracing::debug!(%peer, mid, "Retransmitted request, replaying ACK");
                send_bytes(&self.socket, &reply, peer).await;
            }
            Seen::Completed(_) => tracing::debug!(%peer, mid, "Duplicate of an answered request"),
        }
    }

    fn spawn_request(&self, message: Message, peer: SocketAddr, tasks: &mut JoinSet<()>) {
        let socket = self.socket.clone();
        let pipeline = self.pipeline.clone();
        let exchanges = self.exchanges.clone();
        let fresh_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);

        tasks.spawn(async move {
            let key = (peer, message.message_id);
            let request = IncomingRequest::from_message(&message);

            // Run the pipeline on its own task so a panic anywhere in it still
            // gets the device an answer.
            let handler = tokio::spawn({
                let pipeline = pipeline.clone();
                async move { pipeline.handle(request).await }
            });
            let response = match handler.await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_panic() {
                        let panic = e.into_panic();
                        tracing::error!(%peer, panic = panic_message(&*panic), "Request handler panicked");
                    } else {
                        tracing::error!(%peer, error = %e, "Request handler cancelled");
                    }
                    pipeline.stats().record(Outcome::HandlerException);
                    GatewayResponse::from(Outcome::HandlerException)
                }
            };

            let reply = message.response(response.code, &response.body, fresh_id);
            match reply.encode() {
                Ok(bytes) => {
                    // Only a piggybacked ACK is replayed; a NON duplicate gets nothing.
                    let cached = (message.mtype == MessageType::Confirmable).then(|| bytes.clone());
                    exchanges.complete(key, cached);
                    send_bytes(&socket, &bytes, peer).await;
                }
                Err(e) => {
                    exchanges.forget(key);
                    tracing::error!(%peer, error = %e, "Failed to encode CoAP reply");
                }
            }
        });
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let in_flight = tasks.len();
        if in_flight == 0 {
            return;
        }
        tracing::info!(
            in_flight,
            grace_secs = self.shutdown_grace.as_secs(),
            "Draining in-flight requests"
        );

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(aborted = tasks.len(), "Grace period elapsed, aborting remaining requests");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

async fn send(socket: &UdpSocket, message: &Message, peer: SocketAddr) {
    match message.encode() {
        Ok(bytes) => send_bytes(socket, &bytes, peer).await,
        Err(e) => tracing::error!(%peer, error = %e, "Failed to encode CoAP reply"),
    }
}

async fn send_bytes(socket: &UdpSocket, bytes: &[u8], peer: SocketAddr) {
    if let Err(e) = socket.send_to(bytes, peer).await {
        tracing::warn!(%peer, error = %e, "Failed to send CoAP reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{Code, OPTION_URI_PATH};
    use crate::endpoints::build_registry;
    use crate::proxy::HttpForwarder;
    use crate::stats::GatewayStats;
    use crate::testing::{spawn_backend, unreachable_addr, BackendBehavior, MockBackend};
    use axum::http::StatusCode;
    use bytes::Bytes;
    use reqwest::Url;
    use tokio::sync::oneshot;

    struct Harness {
        client: UdpSocket,
        server_addr: SocketAddr,
        stop: oneshot::Sender<()>,
        done: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Harness {
        async fn start(backend: SocketAddr) -> Self {
            let base = Url::parse(&format!("http://{backend}")).unwrap();
            let forwarder = HttpForwarder::new(base, Duration::from_secs(2)).unwrap();
            let pipeline = Arc::new(RequestPipeline::new(
                build_registry().unwrap(),
                forwarder,
                Arc::new(GatewayStats::new()),
            ));
            let config = ServerConfig {
                listen_address: "127.0.0.1:0".to_string(),
                ..ServerConfig::default()
            };
            let server = CoapServer::bind(&config, pipeline).await.unwrap();
            let server_addr = server.local_addr().unwrap();

            let (stop, stopped) = oneshot::channel::<()>();
            let done = tokio::spawn(server.run(async move {
                let _ = stopped.await;
            }));

            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            Self {
                client,
                server_addr,
                stop,
                done,
            }
        }

        async fn exchange(&self, datagram: &[u8]) -> Message {
            self.client.send_to(datagram, self.server_addr).await.unwrap();
            let mut buf = [0u8; 2048];
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), self.client.recv_from(&mut buf))
                .await
                .expect("no reply from gateway")
                .unwrap();
            Message::decode(&buf[..len]).unwrap()
        }

        async fn stop(self) {
            self.stop.send(()).unwrap();
            self.done.await.unwrap().unwrap();
        }
    }

    fn request(mtype: MessageType, code: Code, path: &str, body: &str) -> Vec<u8> {
        let mut msg = Message::new(mtype, code, 0x1234, Bytes::from_static(&[0xAB, 0xCD]));
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            msg.add_option(OPTION_URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
        }
        msg.payload = Bytes::copy_from_slice(body.as_bytes());
        msg.encode().unwrap().to_vec()
    }

    async fn healthy_backend() -> MockBackend {
        spawn_backend(BackendBehavior::status(StatusCode::NO_CONTENT)).await
    }

    #[tokio::test]
    async fn confirmable_post_gets_piggybacked_ack() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        let reply = gw
            .exchange(&request(
                MessageType::Confirmable,
                Code::POST,
                "/sensor/station-1/temperature",
                r#"{"temperature": 22.5}"#,
            ))
            .await;

        assert_eq!(reply.mtype, MessageType::Acknowledgement);
        assert_eq!(reply.message_id, 0x1234);
        assert_eq!(reply.token.as_ref(), &[0xAB, 0xCD]);
        assert_eq!(reply.code, Code::CHANGED);
        assert_eq!(reply.payload.as_ref(), b"OK");

        let received = backend.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].path, "/api/sensors/station-1/temperature");
        assert_eq!(received[0].body, serde_json::json!({"temperature": 22.5}));
        assert!(received[0].request_id.is_some());

        gw.stop().await;
    }

    #[tokio::test]
    async fn non_confirmable_get_gets_non_response() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        let reply = gw
            .exchange(&request(
                MessageType::NonConfirmable,
                Code::GET,
                "/sensor/station-1/temperature",
                "",
            ))
            .await;

        assert_eq!(reply.mtype, MessageType::NonConfirmable);
        assert_eq!(reply.token.as_ref(), &[0xAB, 0xCD]);
        assert_eq!(reply.code, Code::METHOD_NOT_ALLOWED);
        assert!(backend.received().is_empty());

        gw.stop().await;
    }

    #[tokio::test]
    async fn pipeline_outcomes_reach_the_device() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;
        let cases = [
            ("/unknown/path", r#"{}"#, Code::NOT_FOUND),
            ("/sensor/wind", "not-json", Code::BAD_REQUEST),
            ("/sensor/station-1/temperature", r#"{"temperature": "warm"}"#, Code::BAD_REQUEST),
        ];

        for (path, body, code) in cases {
            let reply = gw
                .exchange(&request(MessageType::Confirmable, Code::POST, path, body))
                .await;
            assert_eq!(reply.code, code, "{path}");
        }
        assert!(backend.received().is_empty());

        gw.stop().await;
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let gw = Harness::start(unreachable_addr().await).await;

        let reply = gw
            .exchange(&request(
                MessageType::Confirmable,
                Code::POST,
                "/sensor/wind",
                r#"{"speed": 4.2, "direction": 270, "sensorId": "anemo-1"}"#,
            ))
            .await;

        assert_eq!(reply.code, Code::BAD_GATEWAY);
        assert_eq!(reply.payload.as_ref(), b"Bad Gateway");

        gw.stop().await;
    }

    #[tokio::test]
    async fn retransmitted_confirmable_is_forwarded_once() {
        let backend = spawn_backend(BackendBehavior {
            status: StatusCode::NO_CONTENT,
            delay: Duration::from_millis(500),
        })
        .await;
        let gw = Harness::start(backend.addr).await;

        let mut msg = Message::new(
            MessageType::Confirmable,
            Code::POST,
            0x0777,
            Bytes::from_static(&[0x01]),
        );
        for segment in ["sensor", "s1", "temperature"] {
            msg.add_option(OPTION_URI_PATH, Bytes::from_static(segment.as_bytes()));
        }
        msg.payload = Bytes::from_static(br#"{"temperature": 20.0}"#);
        let datagram = msg.encode().unwrap();

        // Retransmit while the first copy is still waiting on the backend.
        gw.client.send_to(&datagram, gw.server_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = gw.exchange(&datagram).await;
        assert_eq!(first.mtype, MessageType::Acknowledgement);
        assert_eq!(first.message_id, 0x0777);
        assert_eq!(first.code, Code::CHANGED);

        let mut buf = [0u8; 256];
        let extra = tokio::time::timeout(Duration::from_millis(300), gw.client.recv_from(&mut buf)).await;
        assert!(extra.is_err(), "in-flight duplicate must not get its own reply");
        assert_eq!(backend.received().len(), 1);

        // A late retransmission is answered from the cache.
        let replay = gw.exchange(&datagram).await;
        assert_eq!(replay.mtype, MessageType::Acknowledgement);
        assert_eq!(replay.message_id, 0x0777);
        assert_eq!(replay.code, Code::CHANGED);
        assert_eq!(replay.token.as_ref(), &[0x01]);
        assert_eq!(backend.received().len(), 1);

        gw.stop().await;
    }

    #[tokio::test]
    async fn new_message_id_is_a_new_request() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        let datagram = request(MessageType::Confirmable, Code::POST, "/sensor/data", "{}");
        gw.exchange(&datagram).await;
        let mut next = Message::decode(&datagram).unwrap();
        next.message_id = 0x1235;
        gw.exchange(&next.encode().unwrap()).await;

        assert_eq!(backend.received().len(), 2);

        gw.stop().await;
    }

    #[tokio::test]
    async fn ping_gets_reset() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        let ping = Message::new(MessageType::Confirmable, Code::EMPTY, 0x0042, Bytes::new());
        let reply = gw.exchange(&ping.encode().unwrap()).await;

        assert_eq!(reply.mtype, MessageType::Reset);
        assert_eq!(reply.message_id, 0x0042);
        assert_eq!(reply.code, Code::EMPTY);

        gw.stop().await;
    }

    #[tokio::test]
    async fn undecodable_confirmable_gets_reset() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        // CON POST, mid 7, then an option byte with the reserved delta nibble.
        let reply = gw.exchange(&[0x40, 0x02, 0x00, 0x07, 0xF0]).await;

        assert_eq!(reply.mtype, MessageType::Reset);
        assert_eq!(reply.message_id, 7);

        gw.stop().await;
    }

    #[tokio::test]
    async fn garbage_is_dropped_and_server_keeps_serving() {
        let backend = healthy_backend().await;
        let gw = Harness::start(backend.addr).await;

        gw.client.send_to(&[0xFF, 0x00], gw.server_addr).await.unwrap();

        let reply = gw
            .exchange(&request(MessageType::Confirmable, Code::POST, "/sensor/data", "{}"))
            .await;
        assert_eq!(reply.code, Code::CHANGED);

        gw.stop().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_request() {
        let backend = spawn_backend(BackendBehavior {
            status: StatusCode::OK,
            delay: Duration::from_millis(300),
        })
        .await;
        let gw = Harness::start(backend.addr).await;

        gw.client
            .send_to(
                &request(MessageType::Confirmable, Code::POST, "/sensor/data", "{}"),
                gw.server_addr,
            )
            .await
            .unwrap();
        // Let the request reach the backend before shutting down.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = gw.client;
        gw.stop.send(()).unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap().code, Code::CHANGED);
        gw.done.await.unwrap().unwrap();
    }
}
