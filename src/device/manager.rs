use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{watch, Mutex, MutexGuard};

use super::{DeviceError, LinkConnector, LinkState, Result};
use crate::events::{EventSender, InspectionEvent};
use crate::serial::{MotionProtocol, ProtocolMetrics};
use crate::stop::StopSignal;

/// Exclusive access to the motion link slot (`None` while disconnected)
pub type LinkSlot<'a> = MutexGuard<'a, Option<MotionProtocol>>;

/// Owns the single motion link and its connection state.
///
/// All traffic goes through the slot lock, so the health supervisor and a run
/// can never interleave requests on the wire.
pub struct DeviceManager {
    link: Arc<Mutex<Option<MotionProtocol>>>,
    connector: Arc<dyn LinkConnector>,
    state_tx: watch::Sender<LinkState>,
    events: EventSender,
}

impl DeviceManager {
    pub fn new(connector: Arc<dyn LinkConnector>, events: EventSender) -> Self {
        let (state_tx, _state_rx) = watch::channel(LinkState::Disconnected);
        Self {
            link: Arc::new(Mutex::new(None)),
            connector,
            state_tx,
            events,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Wait for exclusive use of the link
    pub async fn lock_link(&self) -> LinkSlot<'_> {
        self.link.lock().await
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            log::info!("Motion link state: {:?}", state);
            self.events.emit(InspectionEvent::LinkStateChanged { state });
        }
    }

    /// Open a link into an empty slot, drain it and release the motor hold.
    pub(crate) async fn establish(&self, slot: &mut Option<MotionProtocol>) -> Result<()> {
        if slot.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }

        self.set_state(LinkState::Connecting);
        log::debug!("Attempting motion link on {}", self.connector.describe());

        let mut protocol = match self.connector.connect().await {
            Ok(protocol) => protocol,
            Err(e) => {
                log::debug!("Motion link connect failed: {}", e);
                self.set_state(LinkState::Disconnected);
                return Err(DeviceError::Link(e));
            }
        };

        protocol.drain().await;
        // A freshly (re)connected board must never be left holding silently
        if let Err(e) = protocol.release().await {
            log::warn!("Release after connect failed: {}", e);
            self.set_state(LinkState::Disconnected);
            return Err(DeviceError::Link(e));
        }

        *slot = Some(protocol);
        self.set_state(LinkState::Connected);
        log::info!("Connected to motion board on {}", self.connector.describe());
        Ok(())
    }

    /// Close whatever is in the slot and report the link as down.
    pub(crate) fn drop_link(&self, slot: &mut Option<MotionProtocol>, reason: &str) {
        if let Some(mut protocol) = slot.take() {
            log::warn!("Dropping motion link: {}", reason);
            protocol.interface_mut().disconnect();
        }
        self.set_state(LinkState::Disconnected);
    }

    pub async fn connect_device(&self) -> Result<()> {
        let mut slot = self.lock_link().await;
        self.establish(&mut slot).await
    }

    pub async fn disconnect_device(&self) -> Result<()> {
        let mut slot = self.lock_link().await;
        let Some(mut protocol) = slot.take() else {
            return Err(DeviceError::NotConnected);
        };
        protocol.interface_mut().disconnect();
        self.set_state(LinkState::Disconnected);
        log::info!("Disconnected from motion board");
        Ok(())
    }

    /// Run `f` against the connected protocol while holding the link.
    pub async fn execute_with_protocol<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MotionProtocol) -> BoxFuture<'_, Result<R>>,
        R: Send,
    {
        let mut slot = self.lock_link().await;
        match slot.as_mut() {
            Some(protocol) => f(protocol).await,
            None => Err(DeviceError::NotConnected),
        }
    }

    pub async fn hold(&self) -> Result<()> {
        self.execute_with_protocol(|p| Box::pin(async move { Ok(p.hold().await?) }))
            .await
    }

    pub async fn release(&self) -> Result<()> {
        self.execute_with_protocol(|p| Box::pin(async move { Ok(p.release().await?) }))
            .await
    }

    pub async fn zero(&self) -> Result<()> {
        self.execute_with_protocol(|p| Box::pin(async move { Ok(p.zero().await?) }))
            .await
    }

    pub async fn move_to(&self, deg: f64, timeout: Duration, stop: &StopSignal) -> Result<()> {
        let stop = stop.clone();
        self.execute_with_protocol(move |p| {
            Box::pin(async move { Ok(p.move_to(deg, timeout, Some(&stop)).await?) })
        })
        .await
    }

    /// Ping once and return the engine counters afterwards
    pub async fn ping(&self, timeout: Duration) -> Result<ProtocolMetrics> {
        self.execute_with_protocol(move |p| {
            Box::pin(async move {
                p.ping(timeout).await?;
                Ok(p.metrics().clone())
            })
        })
        .await
    }
}
