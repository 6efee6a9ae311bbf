//! Per-packet entry point.
use std::sync::Arc;

use log::{debug, trace};

use crate::bot::dedup::DedupFilter;
use crate::bot::dispatch::{Dispatcher, QueryUnit};
use crate::bot::parser::{parse_from, ParseNoOp};
use crate::bot::sender::OutboundSender;
use crate::bot::state::BotStateReader;
use crate::errors::DispatchError;
use crate::logutil::escape_log;
use crate::meshtastic::{InboundPacket, PortKind};
use crate::metrics;

/// What happened to an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    Duplicate,
    Inactive,
    NotText,
    NotCommand,
    EmptyQuery,
    Dispatched,
    Rejected(DispatchError),
}

pub struct InboundListener {
    dedup: Arc<DedupFilter>,
    state: BotStateReader,
    dispatcher: Arc<Dispatcher>,
    sender: Option<OutboundSender>,
}

impl InboundListener {
    pub fn new(dedup: Arc<DedupFilter>, state: BotStateReader, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dedup,
            state,
            dispatcher,
            sender: None,
        }
    }

    /// Transport replies go out on; replaced on every (re)connect.
    pub fn set_sender(&mut self, sender: Option<OutboundSender>) {
        self.sender = sender;
    }

    pub async fn on_packet(&self, packet: InboundPacket) -> PacketDisposition {
        metrics::inc_packets_received();
        if !self.dedup.should_process(packet.packet_id) {
            metrics::inc_duplicates_dropped();
            trace!("Duplicate packet id={} from {}", packet.packet_id, packet.source_id);
            return PacketDisposition::Duplicate;
        }

        // Snapshot taken here is the one the unit runs with
        let service = match self.state.active_service() {
            Some(service) => service,
            None => return PacketDisposition::Inactive,
        };
        let sender = match &self.sender {
            Some(sender) => sender.clone(),
            None => return PacketDisposition::Inactive,
        };

        if packet.port_kind != PortKind::TextMessage {
            return PacketDisposition::NotText;
        }

        debug!(
            "Text from {} (id={}): '{}'",
            packet.source_id,
            packet.packet_id,
            escape_log(&packet.text)
        );
        let query = match parse_from(&packet.source_id, &packet.text, &service.config.command_prefix) {
            Ok(query) => query,
            Err(ParseNoOp::NotCommand) => return PacketDisposition::NotCommand,
            Err(ParseNoOp::EmptyQuery) => return PacketDisposition::EmptyQuery,
        };

        let unit = QueryUnit {
            query,
            service,
            sender,
        };
        match self.dispatcher.dispatch(unit).await {
            Ok(()) => PacketDisposition::Dispatched,
            Err(e) => PacketDisposition::Rejected(e),
        }
    }
}
