//! # Meshtastic Device Communication Module
//!
//! Talks to a Meshtastic radio over its serial stream API and exposes the two
//! things the bridge needs from the mesh:
//!
//! - a stream of decoded [`InboundPacket`]s, and
//! - a [`TextTransport`] that puts text on the air.
//!
//! ## Tasks
//!
//! A connected link runs two tasks that share the port handle:
//!
//! ```text
//!  serial port ──► MeshtasticReader ──► InboundPacket channel ──► listener
//!       ▲                 │
//!       │                 └──► LinkEvent channel (node id, link lost)
//!       │
//!  MeshtasticWriter ◄── OutgoingMessage channel ◄── WriterHandle (TextTransport)
//! ```
//!
//! The writer is the only task that writes text packets, so any number of
//! concurrent callers can hold a [`WriterHandle`]; their sends are serialized
//! here and each caller gets its own write result back through a oneshot.
//!
//! ## Configuration
//!
//! ```toml
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! channel = 0
//! min_send_gap_ms = 2000
//! ```

pub mod framing;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::errors::TransportError;
use crate::logutil::{escape_log, hex_snippet};
use crate::protobuf::meshtastic as proto;
use framing::{encode_frame, FrameDecoder};

/// Node number meaning "all nodes"
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Read errors in a row after which the link is reported lost
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Application kind of an inbound packet (Meshtastic `PortNum`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    TextMessage,
    Position,
    NodeInfo,
    Routing,
    Telemetry,
    Other(i32),
}

impl PortKind {
    pub fn from_portnum(portnum: i32) -> Self {
        match proto::PortNum::try_from(portnum) {
            Ok(proto::PortNum::TextMessageApp) => PortKind::TextMessage,
            Ok(proto::PortNum::PositionApp) => PortKind::Position,
            Ok(proto::PortNum::NodeinfoApp) => PortKind::NodeInfo,
            Ok(proto::PortNum::RoutingApp) => PortKind::Routing,
            Ok(proto::PortNum::TelemetryApp) => PortKind::Telemetry,
            _ => PortKind::Other(portnum),
        }
    }
}

/// One packet received from the mesh.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Sender in `!xxxxxxxx` node id notation
    pub source_id: String,
    /// Packet id assigned by the sender (0 = none)
    pub packet_id: u32,
    pub port_kind: PortKind,
    /// Text payload; empty for non-text kinds
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundPacket {
    /// Convenience constructor for a text message packet.
    pub fn text_message(source_id: impl Into<String>, packet_id: u32, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            packet_id,
            port_kind: PortKind::TextMessage,
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Format a node number the way Meshtastic clients show node ids.
pub fn node_label(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Anything that can put text on the mesh.
#[async_trait]
pub trait TextTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Broadcast `text` to all nodes on the link's channel.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
}

/// Outgoing message structure for the writer task
#[derive(Debug)]
pub struct OutgoingMessage {
    pub channel: u32,
    pub content: String,
    /// Receives the write result once the frame has been written (or failed)
    pub done: Option<oneshot::Sender<Result<(), String>>>,
}

/// Control messages for the reader and writer tasks
#[derive(Debug)]
pub enum ControlMessage {
    Shutdown,
    SetNodeId(u32),
}

/// Link-level notifications from the reader to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The radio reported our own node number
    NodeId(u32),
    /// The port stopped working; the reader has exited
    Lost(String),
}

/// A bidirectional byte stream to a radio (a serial port, or a fake in tests).
pub trait RadioPort: Read + Write + Send {}
impl<T: Read + Write + Send> RadioPort for T {}

pub type SharedPort = Arc<Mutex<Box<dyn RadioPort>>>;

/// Per-link settings
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Channel index used for outgoing text
    pub channel: u32,
    /// Minimum gap between text transmissions
    pub min_send_gap: Duration,
    /// Interval between keepalive heartbeats
    pub heartbeat_interval: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            channel: 0,
            min_send_gap: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Cloneable sending side of a link.
#[derive(Clone)]
pub struct WriterHandle {
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    connected: Arc<AtomicBool>,
    channel: u32,
}

impl WriterHandle {
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.mark_disconnected();
        let _ = self.control_tx.send(ControlMessage::Shutdown);
    }
}

#[async_trait]
impl TextTransport for WriterHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outgoing_tx.is_closed()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        let msg = OutgoingMessage {
            channel: self.channel,
            content: text.to_string(),
            done: Some(done_tx),
        };
        self.outgoing_tx
            .send(msg)
            .map_err(|_| TransportError::WriterGone)?;
        match done_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::Write(reason)),
            Err(_) => Err(TransportError::WriterGone),
        }
    }
}

/// A running link: the writer handle, the inbound streams and the task handles.
pub struct MeshLink {
    pub writer: WriterHandle,
    pub inbound_rx: mpsc::UnboundedReceiver<InboundPacket>,
    pub link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    pub tasks: LinkTasks,
}

/// Handles needed to stop a link's tasks.
pub struct LinkTasks {
    writer: WriterHandle,
    reader_control_tx: mpsc::UnboundedSender<ControlMessage>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl LinkTasks {
    /// Stop both tasks and wait for them to exit.
    pub async fn shutdown(self) {
        self.writer.shutdown();
        let _ = self.reader_control_tx.send(ControlMessage::Shutdown);
        let _ = self.writer_task.await;
        let _ = self.reader_task.await;
        debug!("Meshtastic link tasks stopped");
    }
}

/// Open a serial port in the mode the stream API expects.
#[cfg(feature = "serial")]
pub async fn open_serial(port_name: &str, baud_rate: u32) -> Result<Box<dyn RadioPort>, TransportError> {
    debug!("Opening serial port {} at {} baud", port_name, baud_rate);
    let mut builder = serialport::new(port_name, baud_rate).timeout(std::time::Duration::from_millis(20));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(|e| TransportError::Open {
        port: port_name.to_string(),
        reason: e.to_string(),
    })?;

    // Toggle DTR/RTS so the device wakes
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    sleep(Duration::from_millis(150)).await;

    // Drop buffered boot console text
    let mut purge_buf = [0u8; 512];
    if let Ok(available) = port.bytes_to_read() {
        if available > 0 {
            let _ = port.read(&mut purge_buf);
        }
    }
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
pub async fn open_serial(_port_name: &str, _baud_rate: u32) -> Result<Box<dyn RadioPort>, TransportError> {
    Err(TransportError::SerialUnavailable)
}

/// Start reader and writer tasks over an opened port.
pub fn spawn_link(port: Box<dyn RadioPort>, settings: LinkSettings) -> MeshLink {
    let shared: SharedPort = Arc::new(Mutex::new(port));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (reader_control_tx, reader_control_rx) = mpsc::unbounded_channel();
    let (writer_control_tx, writer_control_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let reader = MeshtasticReader {
        port: shared.clone(),
        decoder: FrameDecoder::new(),
        inbound_tx,
        link_tx,
        control_rx: reader_control_rx,
        writer_control_tx: writer_control_tx.clone(),
        our_node_id: None,
        consecutive_errors: 0,
        connected: connected.clone(),
    };
    let writer = MeshtasticWriter {
        port: shared,
        outgoing_rx,
        control_rx: writer_control_rx,
        our_node_id: None,
        last_text_send: None,
        settings: settings.clone(),
    };

    let reader_task = tokio::spawn(async move {
        if let Err(e) = reader.run().await {
            error!("Reader task failed: {}", e);
        }
    });
    let writer_task = tokio::spawn(async move {
        if let Err(e) = writer.run().await {
            error!("Writer task failed: {}", e);
        }
    });

    let writer = WriterHandle {
        outgoing_tx,
        control_tx: writer_control_tx,
        connected,
        channel: settings.channel,
    };
    MeshLink {
        writer: writer.clone(),
        inbound_rx,
        link_rx,
        tasks: LinkTasks {
            writer,
            reader_control_tx,
            reader_task,
            writer_task,
        },
    }
}

/// Turn a decoded `FromRadio` into an inbound packet, if it carries one.
///
/// Encrypted packets (no channel key on this node) and our own packets are dropped.
pub fn inbound_from_radio(msg: proto::FromRadio, our_node_id: Option<u32>) -> Option<InboundPacket> {
    use proto::from_radio::PayloadVariant as FRPayload;
    use proto::mesh_packet::PayloadVariant as MPPayload;

    let pkt = match msg.payload_variant {
        Some(FRPayload::Packet(pkt)) => pkt,
        _ => return None,
    };
    if our_node_id == Some(pkt.from) {
        trace!("Ignoring our own packet id={}", pkt.id);
        return None;
    }
    let data = match pkt.payload_variant {
        Some(MPPayload::Decoded(data)) => data,
        Some(MPPayload::Encrypted(_)) => {
            trace!("Encrypted packet from 0x{:08x} ignored", pkt.from);
            return None;
        }
        None => return None,
    };
    let port_kind = PortKind::from_portnum(data.portnum);
    let text = if port_kind == PortKind::TextMessage {
        String::from_utf8_lossy(&data.payload).into_owned()
    } else {
        String::new()
    };
    Some(InboundPacket {
        source_id: node_label(pkt.from),
        packet_id: pkt.id,
        port_kind,
        text,
        received_at: Utc::now(),
    })
}

/// Reader task: decodes frames and forwards packets and link events
pub struct MeshtasticReader {
    port: SharedPort,
    decoder: FrameDecoder,
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    writer_control_tx: mpsc::UnboundedSender<ControlMessage>,
    our_node_id: Option<u32>,
    consecutive_errors: u32,
    connected: Arc<AtomicBool>,
}

impl MeshtasticReader {
    pub async fn run(mut self) -> Result<(), TransportError> {
        info!("Starting Meshtastic reader task");
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::Shutdown) | None => {
                            info!("Reader task received shutdown signal");
                            break;
                        }
                        Some(_) => {}
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.read_and_process() {
                        self.consecutive_errors += 1;
                        warn!("Serial read error ({} in a row): {}", self.consecutive_errors, e);
                        if self.consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            error!("Meshtastic link lost: {}", e);
                            self.connected.store(false, Ordering::SeqCst);
                            let _ = self.link_tx.send(LinkEvent::Lost(e.to_string()));
                            break;
                        }
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }

        info!("Meshtastic reader task shutting down");
        Ok(())
    }

    fn read_and_process(&mut self) -> Result<(), std::io::Error> {
        let mut buffer = [0u8; 1024];
        let read_result = {
            let mut port = self
                .port
                .lock()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "port lock poisoned"))?;
            port.read(&mut buffer)
        };

        match read_result {
            Ok(0) => Ok(()),
            Ok(n) => {
                self.consecutive_errors = 0;
                trace!("RAW {} bytes: {}", n, hex_snippet(&buffer[..n], 64));
                self.decoder.push(&buffer[..n]);
                while let Some(frame) = self.decoder.next_frame() {
                    self.process_frame(&frame);
                }
                Ok(())
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                self.consecutive_errors = 0;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn process_frame(&mut self, data: &[u8]) {
        use proto::from_radio::PayloadVariant as FRPayload;

        let msg = match proto::FromRadio::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Undecodable FromRadio frame ({} bytes): {}", data.len(), e);
                return;
            }
        };
        match &msg.payload_variant {
            Some(FRPayload::MyInfo(info)) => {
                self.our_node_id = Some(info.my_node_num);
                info!("Connected to node {}", node_label(info.my_node_num));
                let _ = self
                    .writer_control_tx
                    .send(ControlMessage::SetNodeId(info.my_node_num));
                let _ = self.link_tx.send(LinkEvent::NodeId(info.my_node_num));
                return;
            }
            Some(FRPayload::NodeInfo(node)) => {
                if let Some(user) = &node.user {
                    trace!(
                        "Node {} is '{}'",
                        node_label(node.num),
                        escape_log(user.long_name.trim())
                    );
                }
                return;
            }
            Some(FRPayload::ConfigCompleteId(id)) => {
                debug!("Received config_complete_id=0x{:08x}", id);
                return;
            }
            Some(FRPayload::Rebooted(_)) => {
                warn!("Radio reported a reboot");
                return;
            }
            _ => {}
        }
        if let Some(packet) = inbound_from_radio(msg, self.our_node_id) {
            debug!(
                "Packet id={} from {} kind={:?}",
                packet.packet_id, packet.source_id, packet.port_kind
            );
            if self.inbound_tx.send(packet).is_err() {
                debug!("Inbound channel closed; packet dropped");
            }
        }
    }
}

/// Writer task: the only path that writes to the radio
pub struct MeshtasticWriter {
    port: SharedPort,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    our_node_id: Option<u32>,
    last_text_send: Option<Instant>,
    settings: LinkSettings,
}

impl MeshtasticWriter {
    pub async fn run(mut self) -> Result<(), TransportError> {
        info!("Starting Meshtastic writer task");

        // Ask for node info and config so the reader learns our node number
        let mut id: u32 = rand::random();
        if id == 0 {
            id = 1;
        }
        debug!("Requesting config from radio (want_config_id=0x{:08x})", id);
        if let Err(e) = self.send_toradio(proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(id)),
        }) {
            warn!("Initial config request failed: {}", e);
        }

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = self.outgoing_rx.recv() => {
                    match msg {
                        Some(mut outgoing) => {
                            let result = self.send_message(&outgoing).await;
                            if let Err(e) = &result {
                                error!("Failed to send message: {}", e);
                            }
                            if let Some(done) = outgoing.done.take() {
                                let _ = done.send(result.map_err(|e| e.to_string()));
                            }
                        }
                        None => {
                            debug!("Outgoing channel closed");
                            break;
                        }
                    }
                }
                control_msg = self.control_rx.recv() => {
                    match control_msg {
                        Some(ControlMessage::SetNodeId(id)) => {
                            self.our_node_id = Some(id);
                            debug!("Writer using node id {}", node_label(id));
                        }
                        Some(ControlMessage::Shutdown) | None => {
                            info!("Writer task received shutdown signal");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let nonce = rand::random::<u32>() & 0xffff;
                    if let Err(e) = self.send_toradio(proto::ToRadio {
                        payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat { nonce })),
                    }) {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
            }
        }

        // Reject anything still queued so callers don't wait forever
        self.outgoing_rx.close();
        while let Ok(mut pending) = self.outgoing_rx.try_recv() {
            if let Some(done) = pending.done.take() {
                let _ = done.send(Err("link shut down".to_string()));
            }
        }
        info!("Meshtastic writer task shutting down");
        Ok(())
    }

    async fn send_message(&mut self, msg: &OutgoingMessage) -> Result<(), TransportError> {
        self.enforce_min_send_gap().await;

        use proto::mesh_packet::PayloadVariant as MPPayload;
        use proto::to_radio::PayloadVariant as TRPayload;

        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: msg.content.as_bytes().to_vec().into(),
            ..Default::default()
        };
        // The firmware fills in `from` when it is zero
        let pkt = proto::MeshPacket {
            from: self.our_node_id.unwrap_or(0),
            to: BROADCAST_ADDR,
            channel: msg.channel,
            payload_variant: Some(MPPayload::Decoded(data)),
            hop_limit: 3,
            want_ack: false,
            ..Default::default()
        };
        self.send_toradio(proto::ToRadio {
            payload_variant: Some(TRPayload::Packet(pkt)),
        })?;
        self.last_text_send = Some(Instant::now());
        debug!(
            "Broadcast text on channel {} ({} bytes): '{}'",
            msg.channel,
            msg.content.len(),
            escape_log(&msg.content)
        );
        Ok(())
    }

    async fn enforce_min_send_gap(&mut self) {
        if let Some(last) = self.last_text_send {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_send_gap {
                let wait = self.settings.min_send_gap - elapsed;
                trace!("Pacing: delaying send by {}ms", wait.as_millis());
                sleep(wait).await;
            }
        }
    }

    fn send_toradio(&mut self, msg: proto::ToRadio) -> Result<(), TransportError> {
        let payload = msg.encode_to_vec();
        let frame = encode_frame(&payload)?;
        let mut port = self
            .port
            .lock()
            .map_err(|_| TransportError::Write("port lock poisoned".to_string()))?;
        port.write_all(&frame)?;
        port.flush()?;
        trace!("ToRadio frame: {}", hex_snippet(&frame, 64));
        Ok(())
    }
}
