//! Test utilities & fakes shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

use meshai::bot::completion::{CompletionBackend, CompletionRequest};
use meshai::bot::BotServer;
use meshai::config::Config;
use meshai::errors::{ServiceError, TransportError};
use meshai::meshtastic::{InboundPacket, TextTransport};

/// Transport that records every broadcast instead of transmitting it.
#[derive(Default)]
pub struct RecordingTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<String>>,
    changed: Notify,
}

impl RecordingTransport {
    pub fn connected() -> Arc<Self> {
        let t = Self::default();
        t.connected.store(true, Ordering::SeqCst);
        Arc::new(t)
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `n` messages were sent (panics after 5 s).
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.changed.notified();
                if self.sent.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for broadcasts");
        self.texts()
    }
}

#[async_trait]
impl TextTransport for RecordingTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text.to_string());
        self.changed.notify_waiters();
        Ok(())
    }
}

type Script = dyn Fn(&CompletionRequest) -> Result<String, ServiceError> + Send + Sync;

/// Backend answering from a closure, optionally after a delay.
///
/// Probe requests ("Hello", 10 tokens) are answered with "hi" and not recorded.
pub struct ScriptedBackend {
    script: Box<Script>,
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, script)
    }

    pub fn with_delay<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            requests: Mutex::new(Vec::new()),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
        })
    }

    /// Always returns the same text.
    pub fn fixed(reply: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(reply.to_string()))
    }

    /// Always fails with `err`.
    pub fn failing(err: ServiceError) -> Arc<Self> {
        Self::new(move |_| Err(err.clone()))
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrent.load(Ordering::SeqCst)
    }
}

fn is_probe(request: &CompletionRequest) -> bool {
    request.user_text == "Hello" && request.max_tokens == 10
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn chat(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        if is_probe(request) {
            return Ok("hi".to_string());
        }
        self.requests.lock().unwrap().push(request.clone());
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        (self.script)(request)
    }

    fn describe(&self) -> String {
        "scripted backend".to_string()
    }
}

pub fn config_with_budget(max_len: usize) -> Config {
    let mut cfg = Config::default();
    cfg.bot.max_response_length = Some(max_len);
    cfg.logging.file = None;
    cfg.dispatch.stats_interval_seconds = 0;
    cfg
}

/// Server wired to a recording transport, armed with `backend` and started.
pub async fn active_server(
    config: Config,
    backend: Arc<dyn CompletionBackend>,
) -> (
    BotServer,
    Arc<RecordingTransport>,
    mpsc::UnboundedSender<InboundPacket>,
) {
    let mut server = BotServer::new(config);
    let transport = RecordingTransport::connected();
    let (tx, rx) = mpsc::unbounded_channel();
    server.attach_transport(transport.clone(), rx);
    server
        .enable_service_with(backend)
        .await
        .expect("enable service");
    server.start().expect("start");
    (server, transport, tx)
}

pub fn text(source: &str, id: u32, body: &str) -> InboundPacket {
    InboundPacket::text_message(source, id, body)
}

/// One canned HTTP response served by [`StubHttp`].
pub struct StubHttp {
    pub base: String,
    bodies: Arc<Mutex<Vec<String>>>,
    headers: Arc<Mutex<Vec<String>>>,
}

impl StubHttp {
    /// Serve `status` + `body` to every connection on a loopback port.
    pub async fn serve(status: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let headers = Arc::new(Mutex::new(Vec::new()));
        let (b, h) = (bodies.clone(), headers.clone());
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let (b, h) = (b.clone(), h.clone());
                tokio::spawn(async move {
                    let (head, req_body) = read_request(&mut sock).await;
                    h.lock().unwrap().push(head);
                    b.lock().unwrap().push(req_body);
                    let resp = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        Self {
            base: format!("http://{}/v1", addr),
            bodies,
            headers,
        }
    }

    pub fn request_bodies(&self) -> Vec<serde_json::Value> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .map(|b| serde_json::from_str(b).expect("request body is JSON"))
            .collect()
    }

    pub fn request_heads(&self) -> Vec<String> {
        self.headers.lock().unwrap().clone()
    }
}

async fn read_request(sock: &mut tokio::net::TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return (String::from_utf8_lossy(&buf).into_owned(), String::new());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).into_owned();
    (head, body)
}
