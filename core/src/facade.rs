// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::select;
use tokio::sync::{mpsc, Notify};

use crate::definitions::{AudioFormat, DeviceState};
use crate::errors::FacadeError;

/// Notifications delivered by the device manager on its own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The sink device moved to a new state.
    StateChanged(DeviceState),
    /// The manager's backing service became available or went away.
    ServiceAvailability { running: bool },
}

/// What the consumer of a listener channel receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Event(ManagerEvent),
    /// State changes were coalesced while the queue was full; the current state must be queried.
    StateResync,
}

#[derive(Debug, Default)]
struct Overflow {
    state_changed: AtomicBool,
    wake: Notify,
}

/// Listener endpoint handed to the device manager in place of a raw callback.
///
/// Delivery never blocks the manager's thread. State changes that do not fit the queue are
/// coalesced into a single [`Delivery::StateResync`]; other events are logged and dropped when the
/// queue is full or the consumer is gone.
#[derive(Debug, Clone)]
pub struct ManagerEventSender {
    tx: mpsc::Sender<ManagerEvent>,
    overflow: Arc<Overflow>,
}

impl ManagerEventSender {
    /// Creates a bounded listener channel.
    pub fn channel(capacity: usize) -> (Self, ManagerEventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(Overflow::default());
        (Self { tx, overflow: overflow.clone() }, ManagerEventReceiver { rx, overflow })
    }

    /// Delivers an event. Returns false when it had to be dropped.
    pub fn notify(&self, event: ManagerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ManagerEvent::StateChanged(state))) => {
                warn!("Manager event queue full, {} will be picked up by a state resync", state);
                self.overflow.state_changed.store(true, Ordering::Release);
                self.overflow.wake.notify_one();
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Manager event queue full, dropping {:?}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!("Manager event consumer is gone, dropping {:?}", event);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a listener channel.
#[derive(Debug)]
pub struct ManagerEventReceiver {
    rx: mpsc::Receiver<ManagerEvent>,
    overflow: Arc<Overflow>,
}

impl ManagerEventReceiver {
    /// Next delivery, or `None` once every sender is gone.
    ///
    /// Queued events always come first. A pending resync is reported only when the queue is empty,
    /// so it is never followed by a state older than the one it reads.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Ok(event) = self.rx.try_recv() {
                return Some(Delivery::Event(event));
            }
            if self.overflow.state_changed.swap(false, Ordering::AcqRel) {
                return Some(Delivery::StateResync);
            }
            select! {
                biased;
                event = self.rx.recv() => return event.map(Delivery::Event),
                _ = self.overflow.wake.notified() => {}
            }
        }
    }
}

/// Device manager that owns the Bluetooth audio sink.
///
/// All calls are synchronous and may block for the duration of a device operation
/// (`acquire`, `relinquish` and `write_frame` in particular). The session coordinator never holds its
/// lock across any of them.
pub trait DeviceManagerFacade: Send + Sync {
    /// Claims the device for `format`, streaming through `connector` with `buffers` transport buffers.
    fn acquire(&self, connector: &str, format: &AudioFormat, buffers: u8) -> Result<(), FacadeError>;

    fn relinquish(&self) -> Result<(), FacadeError>;

    /// Playback speed in percent; 100 starts streaming, 0 pauses it.
    fn set_speed(&self, percent: u8) -> Result<(), FacadeError>;

    /// Hands one frame to the device and returns how much of it was played.
    fn write_frame(&self, data: &[u8]) -> Result<u16, FacadeError>;

    /// Number of samples buffered ahead of the speaker.
    fn query_delay(&self) -> Result<u32, FacadeError>;

    fn query_state(&self) -> DeviceState;

    fn register_state_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError>;
    fn unregister_state_listener(&self) -> Result<(), FacadeError>;

    fn register_service_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError>;
    fn unregister_service_listener(&self) -> Result<(), FacadeError>;

    /// Releases every resource held by the manager client. Safe to call more than once.
    fn dispose(&self);
}
