//! Bot state controller.
//!
//! Two independent conditions (device connected, service armed) and one
//! explicit switch (active) decide whether inbound queries are processed. The
//! controller is owned by the server; everyone else observes it through a
//! [`BotStateReader`] backed by a `watch` channel.
use std::fmt;
use std::sync::Arc;

use log::info;
use tokio::sync::watch;

use crate::bot::completion::CompletionAdapter;
use crate::config::BotConfig;
use crate::errors::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Disconnected,
    Connected,
    ServiceReady,
    Active,
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotState::Disconnected => "disconnected",
            BotState::Connected => "connected",
            BotState::ServiceReady => "service ready",
            BotState::Active => "active",
        };
        f.write_str(s)
    }
}

/// The armed service: config snapshot plus the adapter built for it.
#[derive(Clone)]
pub struct ServiceHandle {
    pub config: Arc<BotConfig>,
    pub completion: Arc<CompletionAdapter>,
}

impl ServiceHandle {
    pub fn new(config: BotConfig, completion: CompletionAdapter) -> Self {
        Self {
            config: Arc::new(config),
            completion: Arc::new(completion),
        }
    }
}

/// What readers see.
#[derive(Clone)]
pub struct BotStatus {
    pub state: BotState,
    /// Present only while active
    pub service: Option<ServiceHandle>,
}

pub struct BotStateController {
    connected: bool,
    service: Option<ServiceHandle>,
    active: bool,
    tx: watch::Sender<BotStatus>,
}

impl Default for BotStateController {
    fn default() -> Self {
        Self::new()
    }
}

impl BotStateController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BotStatus {
            state: BotState::Disconnected,
            service: None,
        });
        Self {
            connected: false,
            service: None,
            active: false,
            tx,
        }
    }

    pub fn reader(&self) -> BotStateReader {
        BotStateReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn state(&self) -> BotState {
        if self.active {
            BotState::Active
        } else if self.connected && self.service.is_some() {
            BotState::ServiceReady
        } else if self.connected {
            BotState::Connected
        } else {
            BotState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected && self.active {
            info!("Device disconnected; bot stopped");
            self.active = false;
        }
        self.publish();
    }

    /// Install a new armed service. Replacing it while active takes effect for
    /// queries accepted from now on.
    pub fn arm(&mut self, service: ServiceHandle) {
        self.service = Some(service);
        self.publish();
    }

    pub fn disarm(&mut self) {
        self.service = None;
        if self.active {
            info!("AI service disabled; bot stopped");
            self.active = false;
        }
        self.publish();
    }

    pub fn start(&mut self) -> Result<(), StateError> {
        if !self.connected {
            return Err(StateError::NotConnected);
        }
        if self.service.is_none() {
            return Err(StateError::ServiceNotReady);
        }
        if !self.active {
            self.active = true;
            info!("Bot started");
            self.publish();
        }
        Ok(())
    }

    /// Returns whether the bot was active.
    pub fn stop(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        info!("Bot stopped");
        self.publish();
        true
    }

    fn publish(&self) {
        let status = BotStatus {
            state: self.state(),
            service: if self.active { self.service.clone() } else { None },
        };
        self.tx.send_replace(status);
    }
}

/// Read-only view of the controller.
#[derive(Clone)]
pub struct BotStateReader {
    rx: watch::Receiver<BotStatus>,
}

impl BotStateReader {
    pub fn is_active(&self) -> bool {
        self.rx.borrow().state == BotState::Active
    }

    pub fn state(&self) -> BotState {
        self.rx.borrow().state
    }

    /// The armed service, if the bot is active.
    pub fn active_service(&self) -> Option<ServiceHandle> {
        self.rx.borrow().service.clone()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Option<BotState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state)
    }
}
