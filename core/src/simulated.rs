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

//! Scripted in-process device manager.
//!
//! Behaves like the real manager for the happy paths (connect, acquire, stream, relinquish,
//! disconnect), records every call, and can be told to fail individual operations.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;

use crate::definitions::{AudioFormat, DeviceState};
use crate::errors::FacadeError;
use crate::facade::{DeviceManagerFacade, ManagerEvent, ManagerEventSender};

/// Facade operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacadeOp {
    Acquire,
    Relinquish,
    SetSpeed,
    WriteFrame,
    QueryDelay,
    RegisterStateListener,
    RegisterServiceListener,
}

/// One recorded call into the facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacadeCall {
    Acquire { connector: String, format: AudioFormat, buffers: u8 },
    Relinquish,
    SetSpeed(u8),
    WriteFrame(usize),
    QueryDelay,
    RegisterStateListener,
    UnregisterStateListener,
    RegisterServiceListener,
    UnregisterServiceListener,
    Dispose,
}

const ERROR_WRONG_STATE: i32 = -16;
const ERROR_SCRIPTED: i32 = -5;

#[derive(Debug, Default)]
struct SimulatedInner {
    state: DeviceState,
    calls: Vec<FacadeCall>,
    failing: HashSet<FacadeOp>,
    delay_samples: u32,
    played_limit: Option<u16>,
    write_latency: Duration,
    state_listener: Option<ManagerEventSender>,
    service_listener: Option<ManagerEventSender>,
    disposed: bool,
}

impl SimulatedInner {
    fn check(&self, op: FacadeOp) -> Result<(), FacadeError> {
        if self.failing.contains(&op) {
            Err(FacadeError::Code(ERROR_SCRIPTED))
        } else {
            Ok(())
        }
    }

    /// Moves the device to `state` and tells the state listener, like the manager thread would.
    fn transition(&mut self, state: DeviceState) {
        debug!("Simulated sink: {} -> {}", self.state, state);
        self.state = state;
        if let Some(listener) = &self.state_listener {
            listener.notify(ManagerEvent::StateChanged(state));
        }
    }
}

/// In-process stand-in for the Bluetooth audio sink device manager.
#[derive(Debug, Default)]
pub struct SimulatedDeviceManager {
    inner: Mutex<SimulatedInner>,
}

impl SimulatedDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts in `state` without notifying anyone.
    pub fn with_state(state: DeviceState) -> Self {
        let manager = Self::new();
        manager.lock().state = state;
        manager
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts an external state change and notifies the state listener.
    pub fn set_state(&self, state: DeviceState) {
        self.lock().transition(state);
    }

    /// Changes the state silently, as if the notification got lost.
    pub fn force_state(&self, state: DeviceState) {
        self.lock().state = state;
    }

    pub fn connect(&self) {
        self.set_state(DeviceState::Connected);
    }

    pub fn disconnect(&self) {
        self.set_state(DeviceState::Disconnected);
    }

    /// Reports the backing service as (un)available through the service listener.
    pub fn set_service_running(&self, running: bool) {
        if let Some(listener) = &self.lock().service_listener {
            listener.notify(ManagerEvent::ServiceAvailability { running });
        }
    }

    pub fn fail(&self, op: FacadeOp) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: FacadeOp) {
        self.lock().failing.remove(&op);
    }

    pub fn set_delay_samples(&self, samples: u32) {
        self.lock().delay_samples = samples;
    }

    /// Caps how much of each written frame is reported as played.
    pub fn set_played_limit(&self, limit: Option<u16>) {
        self.lock().played_limit = limit;
    }

    /// Makes every `write_frame` block for `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    pub fn calls(&self) -> Vec<FacadeCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<FacadeCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn count_calls(&self, predicate: impl Fn(&FacadeCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn has_state_listener(&self) -> bool {
        self.lock().state_listener.is_some()
    }

    pub fn has_service_listener(&self) -> bool {
        self.lock().service_listener.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}

impl DeviceManagerFacade for SimulatedDeviceManager {
    fn acquire(&self, connector: &str, format: &AudioFormat, buffers: u8) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::Acquire {
            connector: connector.to_string(),
            format: *format,
            buffers,
        });
        inner.check(FacadeOp::Acquire)?;
        if inner.state != DeviceState::Connected {
            return Err(FacadeError::Code(ERROR_WRONG_STATE));
        }
        inner.transition(DeviceState::Ready);
        Ok(())
    }

    fn relinquish(&self) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::Relinquish);
        inner.check(FacadeOp::Relinquish)?;
        if !inner.state.is_acquired() {
            return Err(FacadeError::Code(ERROR_WRONG_STATE));
        }
        inner.transition(DeviceState::Connected);
        Ok(())
    }

    fn set_speed(&self, percent: u8) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::SetSpeed(percent));
        inner.check(FacadeOp::SetSpeed)?;
        match (inner.state, percent) {
            (DeviceState::Ready, 100) => inner.transition(DeviceState::Streaming),
            (DeviceState::Streaming, 0) => inner.transition(DeviceState::Ready),
            (DeviceState::Ready, 0) | (DeviceState::Streaming, 100) => {}
            _ => return Err(FacadeError::Code(ERROR_WRONG_STATE)),
        }
        Ok(())
    }

    fn write_frame(&self, data: &[u8]) -> Result<u16, FacadeError> {
        let (latency, played) = {
            let mut inner = self.lock();
            inner.calls.push(FacadeCall::WriteFrame(data.len()));
            inner.check(FacadeOp::WriteFrame)?;
            if inner.state != DeviceState::Streaming {
                return Err(FacadeError::Code(ERROR_WRONG_STATE));
            }
            let full = u16::try_from(data.len()).unwrap_or(u16::MAX);
            let played = inner.played_limit.map_or(full, |limit| limit.min(full));
            (inner.write_latency, played)
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(played)
    }

    fn query_delay(&self) -> Result<u32, FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::QueryDelay);
        inner.check(FacadeOp::QueryDelay)?;
        Ok(inner.delay_samples)
    }

    fn query_state(&self) -> DeviceState {
        self.lock().state
    }

    fn register_state_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::RegisterStateListener);
        inner.check(FacadeOp::RegisterStateListener)?;
        inner.state_listener = Some(listener);
        Ok(())
    }

    fn unregister_state_listener(&self) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::UnregisterStateListener);
        inner.state_listener = None;
        Ok(())
    }

    fn register_service_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::RegisterServiceListener);
        inner.check(FacadeOp::RegisterServiceListener)?;
        inner.service_listener = Some(listener);
        Ok(())
    }

    fn unregister_service_listener(&self) -> Result<(), FacadeError> {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::UnregisterServiceListener);
        inner.service_listener = None;
        Ok(())
    }

    fn dispose(&self) {
        let mut inner = self.lock();
        inner.calls.push(FacadeCall::Dispose);
        inner.state_listener = None;
        inner.service_listener = None;
        inner.disposed = true;
    }
}
