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

use std::sync::Arc;

use log::{debug, warn};

use crate::config::SinkConfig;
use crate::coordinator::StateCoordinator;
use crate::definitions::{AudioFormat, StreamSpec};
use crate::errors::{SinkError, Transition};
use crate::facade::DeviceManagerFacade;
use crate::lifecycle::SinkLifecycle;
use crate::session_state::SessionSnapshot;

/// Pull-model audio sink backed by a Bluetooth audio device.
///
/// The rendering pipeline calls `open`, `prepare` once per format, `write` repeatedly, then
/// `unprepare` and `close`. `reset` may be called at any time, including from another thread while
/// `write` is blocked.
pub struct BluetoothAudioSink<F: DeviceManagerFacade + 'static> {
    coordinator: Arc<StateCoordinator<F>>,
    lifecycle: SinkLifecycle<F>,
}

impl<F: DeviceManagerFacade + 'static> BluetoothAudioSink<F> {
    /// Creates the sink and starts listening to the device manager.
    ///
    /// The manager events are consumed by a task, so this fails with [`SinkError::NotRunning`]
    /// when called outside a tokio runtime.
    pub fn new(facade: Arc<F>, config: SinkConfig) -> Result<Self, SinkError> {
        let coordinator = Arc::new(StateCoordinator::new(facade, &config));
        let lifecycle = SinkLifecycle::start(coordinator.clone(), &config)?;
        Ok(Self { coordinator, lifecycle })
    }

    /// Eagerly acquires the device if it is already connected.
    pub fn open(&self) -> Result<(), SinkError> {
        debug!("open");
        self.coordinator
            .acquire(false, None)
            .map(|_| ())
            .inspect_err(|e| warn!("Bluetooth audio sink not acquired on open: {}", e))
    }

    /// Negotiates the stream format, acquires the device for it and starts playback.
    ///
    /// An unconnected device is not an error: the acquisition and playback are resumed once the
    /// device manager reports a connection.
    pub fn prepare(&self, spec: &StreamSpec) -> Result<AudioFormat, SinkError> {
        debug!("prepare {:?}", spec);
        let format = spec.negotiate()?;
        self.coordinator.acquire(true, Some(format))?;
        self.coordinator.start()?;
        Ok(format)
    }

    pub fn unprepare(&self) -> Transition {
        debug!("unprepare");
        self.coordinator.stop()
    }

    pub fn close(&self) -> Transition {
        debug!("close");
        self.coordinator.relinquish()
    }

    /// Writes samples and returns how many bytes the device consumed.
    pub fn write(&self, data: &[u8]) -> usize {
        self.coordinator.frame(data)
    }

    /// Frames queued in the device.
    pub fn delay(&self) -> u32 {
        self.coordinator.delay()
    }

    /// Makes the next `write` return without waiting for the device.
    pub fn reset(&self) {
        debug!("reset");
        self.coordinator.reset();
    }

    pub fn session(&self) -> SessionSnapshot {
        self.coordinator.session()
    }

    pub fn coordinator(&self) -> &Arc<StateCoordinator<F>> {
        &self.coordinator
    }

    /// Unregisters from the device manager, disposes it and stops the event dispatcher.
    pub async fn shutdown(self) {
        self.lifecycle.shutdown().await;
    }
}
