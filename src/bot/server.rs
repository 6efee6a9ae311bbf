//! Bot server: owns the pipeline and the radio link.
//!
//! The server is the single owner of the state controller and the link. All
//! control operations (connect, enable service, start, ...) are `&mut self`
//! methods; the per-packet work fans out through the dispatcher so the event
//! loop never waits on the completion service.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::bot::completion::{CompletionAdapter, CompletionBackend, OpenAiBackend};
use crate::bot::dedup::DedupFilter;
use crate::bot::dispatch::{DispatchStats, Dispatcher};
use crate::bot::listener::{InboundListener, PacketDisposition};
use crate::bot::sender::OutboundSender;
use crate::bot::state::{BotState, BotStateController, BotStateReader, ServiceHandle};
use crate::config::{BotConfig, Config};
use crate::errors::{SendError, StateError};
use crate::meshtastic::{
    node_label, open_serial, spawn_link, InboundPacket, LinkEvent, LinkSettings, LinkTasks,
    RadioPort, TextTransport,
};
use crate::metrics;

/// How long shutdown waits for in-flight replies
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BotServer {
    config: Config,
    controller: BotStateController,
    dedup: Arc<DedupFilter>,
    dispatcher: Arc<Dispatcher>,
    listener: InboundListener,
    transport: Option<Arc<dyn TextTransport>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<InboundPacket>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    link_tasks: Option<LinkTasks>,
    our_node_id: Option<u32>,
}

impl BotServer {
    /// Build the server. Must be called inside a Tokio runtime when the
    /// dispatcher runs in pool mode (workers are spawned here).
    pub fn new(config: Config) -> Self {
        let controller = BotStateController::new();
        let dedup = Arc::new(DedupFilter::from_config(&config.dedup));
        let dispatcher = Arc::new(Dispatcher::from_config(&config.dispatch));
        let listener = InboundListener::new(dedup.clone(), controller.reader(), dispatcher.clone());
        Self {
            config,
            controller,
            dedup,
            dispatcher,
            listener,
            transport: None,
            inbound_rx: None,
            link_rx: None,
            link_tasks: None,
            our_node_id: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bot and llm section edits apply at the next `enable_service`.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn state(&self) -> BotState {
        self.controller.state()
    }

    pub fn state_reader(&self) -> BotStateReader {
        self.controller.reader()
    }

    pub fn is_active(&self) -> bool {
        self.controller.is_active()
    }

    pub fn our_node_id(&self) -> Option<u32> {
        self.our_node_id
    }

    /// Open the serial device (configured port unless overridden) and start the link.
    pub async fn connect_device(&mut self, port: Option<&str>) -> Result<()> {
        if self.transport.is_some() {
            self.disconnect().await;
        }
        let port = port
            .map(str::to_string)
            .unwrap_or_else(|| self.config.meshtastic.port.clone());
        info!(
            "Connecting to Meshtastic device on {} at {} baud",
            port, self.config.meshtastic.baud_rate
        );
        let raw = open_serial(&port, self.config.meshtastic.baud_rate)
            .await
            .map_err(|e| anyhow!("Failed to connect to {}: {}", port, e))?;
        self.connect_port(raw);
        info!("Connected to Meshtastic device on {}", port);
        Ok(())
    }

    /// Start the reader/writer link over an already opened port.
    pub fn connect_port(&mut self, raw: Box<dyn RadioPort>) {
        if let Some(old) = self.link_tasks.take() {
            tokio::spawn(old.shutdown());
        }
        let mut min_send_gap_ms = self.config.meshtastic.min_send_gap_ms;
        if min_send_gap_ms < 1000 {
            warn!(
                "Configured min_send_gap_ms={}ms is below 1000ms; clamping to 1000ms",
                min_send_gap_ms
            );
            min_send_gap_ms = 1000;
        }
        let settings = LinkSettings {
            channel: self.config.meshtastic.channel,
            min_send_gap: Duration::from_millis(min_send_gap_ms),
            ..LinkSettings::default()
        };
        let link = spawn_link(raw, settings);
        let transport: Arc<dyn TextTransport> = Arc::new(link.writer);
        self.attach_transport(transport, link.inbound_rx);
        self.link_rx = Some(link.link_rx);
        self.link_tasks = Some(link.tasks);
    }

    /// Wire a caller-supplied transport and packet stream in place of a serial link.
    pub fn attach_transport(
        &mut self,
        transport: Arc<dyn TextTransport>,
        inbound_rx: mpsc::UnboundedReceiver<InboundPacket>,
    ) {
        self.dedup.clear();
        self.listener
            .set_sender(Some(OutboundSender::new(transport.clone())));
        self.transport = Some(transport);
        self.inbound_rx = Some(inbound_rx);
        self.controller.set_connected(true);
    }

    /// Tear the link down. Stops the bot if it was active.
    pub async fn disconnect(&mut self) {
        self.controller.set_connected(false);
        self.listener.set_sender(None);
        self.transport = None;
        self.inbound_rx = None;
        self.link_rx = None;
        self.our_node_id = None;
        if let Some(tasks) = self.link_tasks.take() {
            tasks.shutdown().await;
        }
        info!("Disconnected from Meshtastic device");
    }

    /// Arm the OpenAI-compatible service using the configured or environment credential.
    pub async fn enable_service(&mut self) -> Result<()> {
        let api_key = self.config.llm.resolve_api_key()?;
        let backend = OpenAiBackend::new(&self.config.llm, api_key)?;
        self.enable_service_with(Arc::new(backend)).await
    }

    /// Arm the service with an explicit backend after validating config and probing it.
    pub async fn enable_service_with(&mut self, backend: Arc<dyn CompletionBackend>) -> Result<()> {
        let bot_config = BotConfig::from_section(&self.config.bot)?;
        let adapter = CompletionAdapter::from_config(backend, &self.config.llm);
        info!("Checking AI service at {}", adapter.backend_name());
        adapter
            .probe()
            .await
            .map_err(|e| anyhow!("AI service check failed: {}", e))?;
        info!(
            "AI service ready (prefix '{}', max {} chars)",
            bot_config.command_prefix, bot_config.max_response_length
        );
        self.controller.arm(ServiceHandle::new(bot_config, adapter));
        Ok(())
    }

    pub fn disable_service(&mut self) {
        self.controller.disarm();
        info!("AI service disabled");
    }

    pub fn start(&mut self) -> Result<(), StateError> {
        self.controller.start()
    }

    /// Returns whether the bot had been active.
    pub fn stop(&mut self) -> bool {
        self.controller.stop()
    }

    /// Broadcast a timestamped test message.
    pub async fn send_test_message(&self) -> Result<(), SendError> {
        let transport = self.transport.clone().ok_or(SendError::NotConnected)?;
        let text = format!(
            "Test message from AI Bot at {}",
            chrono::Local::now().format("%H:%M:%S")
        );
        OutboundSender::new(transport).broadcast(&text).await?;
        info!("Sent test message: {}", text);
        Ok(())
    }

    /// Feed one packet through the pipeline.
    pub async fn handle_packet(&self, packet: InboundPacket) -> PacketDisposition {
        let disposition = self.listener.on_packet(packet).await;
        if let PacketDisposition::Rejected(e) = disposition {
            warn!("Query not dispatched: {}", e);
        }
        disposition
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::NodeId(id) => {
                self.our_node_id = Some(id);
                debug!("Server received our node ID: {}", node_label(id));
            }
            LinkEvent::Lost(reason) => {
                error!("Lost connection to Meshtastic device: {}", reason);
                self.disconnect().await;
            }
        }
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.snapshot()
    }

    /// Wait until every dispatched unit has finished.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await
    }

    pub fn status_line(&self) -> String {
        let d = self.dispatcher.snapshot();
        let m = metrics::snapshot();
        format!(
            "state={} packets={} dup={} dispatched={} completed={} in_flight={} queued={} rejected={} dropped={} replies={} send_fail={} svc_err={} avg_ms={}",
            self.controller.state(),
            m.packets_received,
            m.duplicates_dropped,
            d.dispatched,
            d.completed,
            d.in_flight,
            d.queued,
            d.rejected,
            d.dropped,
            m.replies_sent,
            m.send_failures,
            m.service_errors,
            m.avg_completion_ms
        )
    }

    /// Process events until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Process events until `shutdown` completes, then drain and disconnect.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("AI bot running (state: {})", self.controller.state());
        tokio::pin!(shutdown);

        let stats_secs = self.config.dispatch.stats_interval_seconds;
        let mut stats_tick = (stats_secs > 0).then(|| {
            let mut t = tokio::time::interval(Duration::from_secs(stats_secs));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });

        loop {
            tokio::select! {
                packet = async {
                    match self.inbound_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match packet {
                        Some(packet) => {
                            let disposition = self.handle_packet(packet).await;
                            debug!("Packet disposition: {:?}", disposition);
                        }
                        None => {
                            warn!("Inbound packet stream closed");
                            self.disconnect().await;
                        }
                    }
                }
                event = async {
                    match self.link_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(event) => self.handle_link_event(event).await,
                        None => self.link_rx = None,
                    }
                }
                _ = async {
                    match stats_tick.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("stats: {}", self.status_line());
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Shutting down AI bot...");
        self.controller.stop();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "Gave up waiting for {} in-flight replies",
                self.dispatcher.snapshot().in_flight
            );
        }
        self.dispatcher.close();
        self.disconnect().await;
        info!("AI bot shutdown complete");
    }
}
