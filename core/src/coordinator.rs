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

use log::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::definitions::{AudioFormat, DeviceState};
use crate::errors::{SinkError, Transition};
use crate::facade::DeviceManagerFacade;
use crate::session_state::{SessionSnapshot, SharedSession};

/// Speed that starts streaming.
pub const SPEED_PLAY: u8 = 100;
/// Speed that pauses streaming.
pub const SPEED_PAUSE: u8 = 0;

/// How a successful `acquire` was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The facade acquired the device just now.
    Acquired,
    /// The device was already held with the requested format.
    AlreadyAcquired,
    /// No connectable device; the request is latched for the next connect.
    Postponed,
}

impl Acquisition {
    /// True when the device is held after the call.
    pub fn is_held(self) -> bool {
        !matches!(self, Acquisition::Postponed)
    }
}

/// Reconciles rendering pipeline requests with device manager notifications.
///
/// Every operation reads and writes the session inside short critical sections. Facade calls,
/// which may block, are always made with the session lock released.
pub struct StateCoordinator<F: DeviceManagerFacade> {
    facade: Arc<F>,
    session: SharedSession,
    connector: String,
    buffer_count: u8,
}

impl<F: DeviceManagerFacade> StateCoordinator<F> {
    pub fn new(facade: Arc<F>, config: &SinkConfig) -> Self {
        Self {
            facade,
            session: SharedSession::new(config.default_format),
            connector: config.connector.clone(),
            buffer_count: config.buffer_count,
        }
    }

    pub fn facade(&self) -> &Arc<F> {
        &self.facade
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Acquires the device, optionally switching to `requested_format`.
    ///
    /// The device can only be claimed while it is connected (or already held by us and idle). With
    /// `postpone` set, an unconnected device latches the request and reports
    /// [`Acquisition::Postponed`] instead of failing.
    ///
    /// A disconnect reported while the facade call runs always latches the request, and a
    /// successful call then reports [`Acquisition::Postponed`] because the device is no longer held.
    pub fn acquire(&self, postpone: bool, requested_format: Option<AudioFormat>) -> Result<Acquisition, SinkError> {
        let state = self.facade.query_state();

        let (format, renegotiate, epoch) = {
            let mut session = self.session.lock();

            if !(state == DeviceState::Connected || (session.acquired && state == DeviceState::Ready)) {
                if postpone && !state.is_acquired() {
                    session.acquire_requested = true;
                    debug!("Device is {}, acquisition postponed until it connects", state);
                    return Ok(Acquisition::Postponed);
                }
                return Err(if state.is_rejected() {
                    SinkError::DeviceRejected { state }
                } else {
                    SinkError::Unavailable { state }
                });
            }

            session.acquire_requested = false;
            let format = requested_format.unwrap_or(session.format);
            let renegotiate = session.acquired;
            if renegotiate {
                if format == session.format {
                    return Ok(Acquisition::AlreadyAcquired);
                }
                info!("Renegotiating sink format: {} -> {}", session.format, format);
                session.acquired = false;
                session.playing = false;
            }
            session.format = format;
            (format, renegotiate, session.disconnects)
        };

        if renegotiate {
            if let Err(e) = self.facade.relinquish() {
                warn!("Failed to relinquish sink before format change: {}", e);
            }
        }

        let result = self.facade.acquire(&self.connector, &format, self.buffer_count);

        let mut session = self.session.lock();
        if session.disconnects != epoch {
            session.acquire_requested = true;
            drop(session);
            warn!("Bluetooth audio sink disconnected during acquisition, retrying on next connect");
            return result.map(|()| Acquisition::Postponed).map_err(|e| SinkError::facade("acquire", e));
        }

        match result {
            Ok(()) => {
                session.acquired = true;
                info!("Acquired Bluetooth audio sink ({})", format);
                Ok(Acquisition::Acquired)
            }
            Err(e) => {
                drop(session);
                error!("Failed to acquire Bluetooth audio sink: {}", e);
                Err(SinkError::facade("acquire", e))
            }
        }
    }

    /// Releases the device. Local state always ends up "not held" even when the facade fails.
    pub fn relinquish(&self) -> Transition {
        let state = self.facade.query_state();
        {
            let mut session = self.session.lock();
            session.acquire_requested = false;
            session.playback_requested = false;
        }

        let result = if state.is_acquired() { self.facade.relinquish() } else { Ok(()) };

        {
            // a disconnect during the call may have latched new requests
            let mut session = self.session.lock();
            session.acquired = false;
            session.playing = false;
            session.acquire_requested = false;
            session.playback_requested = false;
        }

        match &result {
            Ok(()) => debug!("Bluetooth audio sink relinquished (device was {})", state),
            Err(e) => error!("Failed to relinquish Bluetooth audio sink: {}", e),
        }
        Transition::from(result)
    }

    /// Starts streaming on an acquired, idle device.
    ///
    /// Nothing happens while the device is not ready. If an acquisition is still pending, the
    /// playback request is latched so the connect handler starts it once the device is acquired.
    pub fn start(&self) -> Result<(), SinkError> {
        let state = self.facade.query_state();
        match state {
            DeviceState::Ready => {
                let epoch = {
                    let session = self.session.lock();
                    if !session.acquired {
                        debug!("Device is ready but not held by this session, not starting");
                        return Ok(());
                    }
                    session.disconnects
                };
                match self.facade.set_speed(SPEED_PLAY) {
                    Ok(()) => {
                        let mut session = self.session.lock();
                        if session.disconnects != epoch {
                            if session.acquire_requested {
                                session.playback_requested = true;
                            }
                            warn!("Bluetooth audio sink disconnected while starting, playback deferred");
                            return Ok(());
                        }
                        session.playing = true;
                        session.playback_requested = false;
                        info!("Bluetooth audio sink playback started");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Failed to start Bluetooth audio sink playback: {}", e);
                        Err(SinkError::facade("set_speed(100)", e))
                    }
                }
            }
            DeviceState::Streaming => {
                let mut session = self.session.lock();
                if session.acquired {
                    session.playing = true;
                    session.playback_requested = false;
                }
                Ok(())
            }
            _ => {
                let mut session = self.session.lock();
                if session.acquire_requested {
                    session.playback_requested = true;
                    debug!("Device is {}, playback deferred until acquisition", state);
                }
                Ok(())
            }
        }
    }

    /// Pauses streaming. Local state always ends up "not playing".
    pub fn stop(&self) -> Transition {
        let state = self.facade.query_state();
        self.session.lock().playback_requested = false;

        let result = if state == DeviceState::Streaming { self.facade.set_speed(SPEED_PAUSE) } else { Ok(()) };

        {
            let mut session = self.session.lock();
            session.playing = false;
            session.playback_requested = false;
        }

        if let Err(e) = &result {
            error!("Failed to stop Bluetooth audio sink playback: {}", e);
        }
        Transition::from(result)
    }

    /// Writes one frame and returns how much of it the device consumed.
    ///
    /// While not playing, a pending reset is consumed by reporting the whole buffer as accepted so
    /// the pipeline's write loop can make progress and exit. A reset cannot interrupt a write that
    /// is already blocked inside the facade; it only affects the next call.
    ///
    /// A reset latched while playing is not consumed by any write and survives `stop`, `relinquish`
    /// and disconnects: the first write after playback ends reports its buffer as accepted.
    pub fn frame(&self, data: &[u8]) -> usize {
        {
            let mut session = self.session.lock();
            if !session.playing {
                if session.reset_requested {
                    session.reset_requested = false;
                    debug!("Reset consumed, discarding {} bytes", data.len());
                    return data.len();
                }
                return 0;
            }
        }

        match self.facade.write_frame(data) {
            Ok(played) => usize::from(played),
            Err(e) => {
                error!("Failed to write frame to Bluetooth audio sink: {}", e);
                0
            }
        }
    }

    /// Frames buffered in the device. The facade counts samples across all channels.
    pub fn delay(&self) -> u32 {
        let channels = {
            let session = self.session.lock();
            if !session.playing {
                return 0;
            }
            u32::from(session.format.channels)
        };

        match self.facade.query_delay() {
            Ok(samples) => samples.checked_div(channels).unwrap_or(0),
            Err(e) => {
                warn!("Failed to query Bluetooth audio sink delay: {}", e);
                0
            }
        }
    }

    /// Latches a reset for the next `frame` call made while not playing.
    pub fn reset(&self) {
        self.session.lock().reset_requested = true;
    }

    /// Applies a device state change reported by the manager.
    pub fn on_state_changed(&self, state: DeviceState) {
        match state {
            DeviceState::Unassigned => warn!("Bluetooth audio sink is currently unassigned"),
            DeviceState::Connected => {
                info!("Bluetooth audio sink is now connected");
                self.on_connected();
            }
            DeviceState::ConnectedBadDevice => error!("Invalid device connected, can't play"),
            DeviceState::ConnectedRestricted => error!("Restricted Bluetooth audio device connected, won't play"),
            DeviceState::Disconnected => {
                warn!("Bluetooth audio sink is now disconnected");
                self.on_disconnected();
            }
            DeviceState::Ready => info!("Bluetooth audio sink is now ready"),
            DeviceState::Streaming => info!("Bluetooth audio sink is now streaming"),
            DeviceState::Unknown => {}
        }
    }

    /// Applies the device's current state after state notifications were coalesced.
    ///
    /// A session still holding a device the manager no longer reports as acquired has missed a
    /// disconnect, which is replayed first so the activity resumes on the next connect.
    pub fn resync(&self, state: DeviceState) {
        let missed_disconnect = {
            let session = self.session.lock();
            (session.acquired || session.playing) && !state.is_acquired()
        };
        if missed_disconnect {
            warn!("Bluetooth audio sink lost while notifications were coalesced (device is {})", state);
            self.on_disconnected();
        }
        self.on_state_changed(state);
    }

    fn on_connected(&self) {
        if !self.session.lock().acquire_requested {
            return;
        }
        match self.acquire(true, None) {
            Ok(acquisition) if acquisition.is_held() => {
                if self.session.lock().playback_requested {
                    if let Err(e) = self.start() {
                        error!("Failed to resume playback after reconnection: {}", e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to acquire Bluetooth audio sink after connection: {}", e),
        }
    }

    /// Turns current activity into pending requests so it resumes on the next connect.
    fn on_disconnected(&self) {
        let mut session = self.session.lock();
        session.disconnects = session.disconnects.wrapping_add(1);
        if session.playing {
            session.playing = false;
            session.playback_requested = true;
        }
        if session.acquired {
            session.acquired = false;
            session.acquire_requested = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FacadeError;
    use crate::facade::ManagerEventSender;
    use crate::simulated::{FacadeCall, FacadeOp, SimulatedDeviceManager};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    fn coordinator(state: DeviceState) -> (Arc<SimulatedDeviceManager>, StateCoordinator<SimulatedDeviceManager>) {
        let manager = Arc::new(SimulatedDeviceManager::with_state(state));
        let coordinator = StateCoordinator::new(manager.clone(), &SinkConfig::default());
        (manager, coordinator)
    }

    fn acquires(manager: &SimulatedDeviceManager) -> usize {
        manager.count_calls(|c| matches!(c, FacadeCall::Acquire { .. }))
    }

    fn relinquishes(manager: &SimulatedDeviceManager) -> usize {
        manager.count_calls(|c| matches!(c, FacadeCall::Relinquish))
    }

    fn playing(manager: &SimulatedDeviceManager, coordinator: &StateCoordinator<SimulatedDeviceManager>) {
        coordinator.acquire(false, None).unwrap();
        coordinator.start().unwrap();
        assert_eq!(manager.query_state(), DeviceState::Streaming);
        manager.take_calls();
    }

    #[test]
    fn open_close_without_connection_never_acquires() {
        for state in [DeviceState::Unknown, DeviceState::Unassigned, DeviceState::Disconnected] {
            let (manager, coordinator) = coordinator(state);
            for _ in 0..3 {
                assert!(matches!(coordinator.acquire(false, None), Err(SinkError::Unavailable { .. })));
                assert!(coordinator.relinquish().is_clean());
                assert!(!coordinator.session().acquired);
            }
            assert_eq!(acquires(&manager), 0);
        }
    }

    #[test]
    fn acquire_on_rejected_device_reports_rejection() {
        let (_, coordinator) = coordinator(DeviceState::ConnectedRestricted);
        assert!(matches!(
            coordinator.acquire(false, None),
            Err(SinkError::DeviceRejected { state: DeviceState::ConnectedRestricted })
        ));
    }

    #[test]
    fn acquire_uses_configured_connector_and_buffers() {
        let manager = Arc::new(SimulatedDeviceManager::with_state(DeviceState::Connected));
        let config = SinkConfig::default().with_connector("/run/sink").with_buffer_count(4);
        let coordinator = StateCoordinator::new(manager.clone(), &config);
        assert_eq!(coordinator.acquire(false, None).unwrap(), Acquisition::Acquired);
        assert_eq!(
            manager.calls(),
            vec![FacadeCall::Acquire {
                connector: "/run/sink".to_string(),
                format: AudioFormat::default(),
                buffers: 4,
            }]
        );
    }

    #[test]
    fn acquire_twice_with_same_format_is_idempotent() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        let format = AudioFormat { sample_rate: 44_100, ..Default::default() };
        assert_eq!(coordinator.acquire(false, Some(format)).unwrap(), Acquisition::Acquired);
        assert_eq!(coordinator.acquire(false, Some(format)).unwrap(), Acquisition::AlreadyAcquired);
        assert_eq!(coordinator.acquire(false, None).unwrap(), Acquisition::AlreadyAcquired);
        assert_eq!(acquires(&manager), 1);
        assert_eq!(coordinator.session().format, format);
    }

    #[test]
    fn format_change_relinquishes_once_then_acquires_once() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.acquire(false, None).unwrap();
        manager.take_calls();

        let new_format = AudioFormat { sample_rate: 44_100, ..Default::default() };
        assert_eq!(coordinator.acquire(true, Some(new_format)).unwrap(), Acquisition::Acquired);

        let calls = manager.take_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], FacadeCall::Relinquish);
        assert!(matches!(&calls[1], FacadeCall::Acquire { format, .. } if *format == new_format));
        assert!(coordinator.session().acquired);
        assert_eq!(coordinator.session().format, new_format);
    }

    #[test]
    fn format_change_continues_when_relinquish_fails() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.acquire(false, None).unwrap();
        manager.fail(FacadeOp::Relinquish);
        // the device stays ready, so the re-acquire is refused by the manager
        let new_format = AudioFormat { channels: 1, bytes_per_frame: 2, ..Default::default() };
        assert!(coordinator.acquire(false, Some(new_format)).is_err());
        assert_eq!(relinquishes(&manager), 1);
        assert_eq!(acquires(&manager), 2);
        assert!(!coordinator.session().acquired);
    }

    #[test]
    fn postponed_acquire_latches_request() {
        let (manager, coordinator) = coordinator(DeviceState::Disconnected);
        assert_eq!(coordinator.acquire(true, None).unwrap(), Acquisition::Postponed);
        let session = coordinator.session();
        assert!(session.acquire_requested);
        assert!(!session.acquired);
        assert_eq!(acquires(&manager), 0);
    }

    #[test]
    fn postpone_is_refused_while_device_is_held_elsewhere() {
        let (_, coordinator) = coordinator(DeviceState::Streaming);
        assert!(coordinator.acquire(true, None).is_err());
        assert!(!coordinator.session().acquire_requested);
    }

    #[test]
    fn failed_acquire_leaves_session_unacquired() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        manager.fail(FacadeOp::Acquire);
        let result = coordinator.acquire(true, None);
        assert!(matches!(result, Err(SinkError::FacadeFailure { op: "acquire", source: FacadeError::Code(_) })));
        let session = coordinator.session();
        assert!(!session.acquired);
        assert!(!session.acquire_requested);
    }

    #[test]
    fn relinquish_clears_everything_even_on_facade_failure() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        manager.fail(FacadeOp::Relinquish);

        let transition = coordinator.relinquish();
        assert!(!transition.is_clean());
        assert!(transition.error().is_some());
        let session = coordinator.session();
        assert!(!session.acquired);
        assert!(!session.playing);
        assert!(!session.acquire_requested);
        assert!(!session.playback_requested);
    }

    #[test]
    fn relinquish_skips_facade_when_device_not_held() {
        let (manager, coordinator) = coordinator(DeviceState::Disconnected);
        coordinator.acquire(true, None).unwrap();
        assert!(coordinator.relinquish().is_clean());
        assert_eq!(relinquishes(&manager), 0);
        assert!(!coordinator.session().acquire_requested);
    }

    #[test]
    fn start_on_ready_device_sets_speed_once() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.acquire(false, None).unwrap();
        coordinator.start().unwrap();
        coordinator.start().unwrap();
        assert!(coordinator.session().playing);
        assert_eq!(manager.count_calls(|c| *c == FacadeCall::SetSpeed(100)), 1);
    }

    #[test]
    fn start_failure_is_reported_and_not_playing() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.acquire(false, None).unwrap();
        manager.fail(FacadeOp::SetSpeed);
        assert!(matches!(coordinator.start(), Err(SinkError::FacadeFailure { .. })));
        assert!(!coordinator.session().playing);
    }

    #[test]
    fn start_without_device_does_nothing() {
        let (manager, coordinator) = coordinator(DeviceState::Unassigned);
        coordinator.start().unwrap();
        let session = coordinator.session();
        assert!(!session.playing);
        assert!(!session.playback_requested);
        assert!(manager.calls().is_empty());
    }

    #[test]
    fn start_while_acquisition_pending_defers_playback() {
        let (_, coordinator) = coordinator(DeviceState::Disconnected);
        coordinator.acquire(true, None).unwrap();
        coordinator.start().unwrap();
        assert!(coordinator.session().playback_requested);
        assert!(!coordinator.session().playing);
    }

    #[test]
    fn stop_pauses_streaming_and_always_clears_playing() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        assert!(coordinator.stop().is_clean());
        assert_eq!(manager.calls(), vec![FacadeCall::SetSpeed(0)]);
        assert!(!coordinator.session().playing);
        assert!(coordinator.session().acquired);

        coordinator.start().unwrap();
        manager.fail(FacadeOp::SetSpeed);
        assert!(!coordinator.stop().is_clean());
        assert!(!coordinator.session().playing);
    }

    #[test]
    fn frame_writes_through_while_playing() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        manager.set_played_limit(Some(1000));
        assert_eq!(coordinator.frame(&[0u8; 4096]), 1000);
        manager.fail(FacadeOp::WriteFrame);
        assert_eq!(coordinator.frame(&[0u8; 4096]), 0);
    }

    #[test]
    fn reset_unblocks_exactly_one_frame() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        let buffer = vec![0u8; 4096];
        assert_eq!(coordinator.frame(&buffer), 0);
        coordinator.reset();
        assert_eq!(coordinator.frame(&buffer), 4096);
        assert_eq!(coordinator.frame(&buffer), 0);
        assert!(!coordinator.session().reset_requested);
        assert_eq!(manager.count_calls(|c| matches!(c, FacadeCall::WriteFrame(_))), 0);
    }

    #[test]
    fn delay_converts_samples_to_frames() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        manager.set_delay_samples(8);
        assert_eq!(coordinator.delay(), 0);
        playing(&manager, &coordinator);
        assert_eq!(coordinator.delay(), 4);
        manager.fail(FacadeOp::QueryDelay);
        assert_eq!(coordinator.delay(), 0);
    }

    #[test]
    fn disconnect_then_reconnect_resumes_playback() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);

        manager.force_state(DeviceState::Disconnected);
        coordinator.on_state_changed(DeviceState::Disconnected);
        let session = coordinator.session();
        assert!(!session.acquired && !session.playing);
        assert!(session.acquire_requested && session.playback_requested);

        manager.force_state(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
        let session = coordinator.session();
        assert!(session.acquired && session.playing);
        assert!(!session.acquire_requested && !session.playback_requested);
        assert_eq!(manager.query_state(), DeviceState::Streaming);
    }

    #[test]
    fn repeated_connect_events_acquire_once() {
        let (manager, coordinator) = coordinator(DeviceState::Disconnected);
        coordinator.acquire(true, None).unwrap();
        manager.force_state(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
        assert_eq!(acquires(&manager), 1);
        assert!(coordinator.session().acquired);
    }

    #[test]
    fn connect_without_request_is_ignored() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
        assert!(manager.calls().is_empty());
        assert!(!coordinator.session().acquired);
    }

    #[test]
    fn informational_states_do_not_touch_session() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        coordinator.acquire(false, None).unwrap();
        let before = coordinator.session();
        for state in [
            DeviceState::Unknown,
            DeviceState::Unassigned,
            DeviceState::ConnectedBadDevice,
            DeviceState::ConnectedRestricted,
            DeviceState::Ready,
            DeviceState::Streaming,
        ] {
            coordinator.on_state_changed(state);
        }
        assert_eq!(coordinator.session(), before);
        assert_eq!(acquires(&manager), 1);
    }

    #[test]
    fn blocked_write_does_not_hold_session_lock() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        manager.set_write_latency(Duration::from_millis(400));

        let coordinator = Arc::new(coordinator);
        let writer = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.frame(&[0u8; 512]))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        coordinator.reset();
        coordinator.on_state_changed(DeviceState::Streaming);
        let _ = coordinator.session();
        assert!(started.elapsed() < Duration::from_millis(200));

        assert_eq!(writer.join().unwrap(), 512);
        // the reset stays latched because the session is still playing
        assert!(coordinator.session().reset_requested);
    }

    /// Reports a disconnect to the coordinator from inside one facade operation, after the device
    /// manager has carried it out but before it returns.
    struct DisconnectingManager {
        inner: SimulatedDeviceManager,
        during: FacadeOp,
        fired: AtomicBool,
        coordinator: OnceLock<Weak<StateCoordinator<DisconnectingManager>>>,
    }

    impl DisconnectingManager {
        fn coordinator(during: FacadeOp) -> Arc<StateCoordinator<DisconnectingManager>> {
            let manager = Arc::new(DisconnectingManager {
                inner: SimulatedDeviceManager::with_state(DeviceState::Connected),
                during,
                fired: AtomicBool::new(false),
                coordinator: OnceLock::new(),
            });
            let coordinator = Arc::new(StateCoordinator::new(manager.clone(), &SinkConfig::default()));
            let _ = manager.coordinator.set(Arc::downgrade(&coordinator));
            coordinator
        }

        fn interleave<T>(&self, op: FacadeOp, result: Result<T, FacadeError>) -> Result<T, FacadeError> {
            if op == self.during && !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.force_state(DeviceState::Disconnected);
                if let Some(coordinator) = self.coordinator.get().and_then(Weak::upgrade) {
                    coordinator.on_state_changed(DeviceState::Disconnected);
                }
            }
            result
        }
    }

    impl DeviceManagerFacade for DisconnectingManager {
        fn acquire(&self, connector: &str, format: &AudioFormat, buffers: u8) -> Result<(), FacadeError> {
            self.interleave(FacadeOp::Acquire, self.inner.acquire(connector, format, buffers))
        }
        fn relinquish(&self) -> Result<(), FacadeError> {
            self.interleave(FacadeOp::Relinquish, self.inner.relinquish())
        }
        fn set_speed(&self, percent: u8) -> Result<(), FacadeError> {
            self.interleave(FacadeOp::SetSpeed, self.inner.set_speed(percent))
        }
        fn write_frame(&self, data: &[u8]) -> Result<u16, FacadeError> {
            self.inner.write_frame(data)
        }
        fn query_delay(&self) -> Result<u32, FacadeError> {
            self.inner.query_delay()
        }
        fn query_state(&self) -> DeviceState {
            self.inner.query_state()
        }
        fn register_state_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError> {
            self.inner.register_state_listener(listener)
        }
        fn unregister_state_listener(&self) -> Result<(), FacadeError> {
            self.inner.unregister_state_listener()
        }
        fn register_service_listener(&self, listener: ManagerEventSender) -> Result<(), FacadeError> {
            self.inner.register_service_listener(listener)
        }
        fn unregister_service_listener(&self) -> Result<(), FacadeError> {
            self.inner.unregister_service_listener()
        }
        fn dispose(&self) {
            self.inner.dispose()
        }
    }

    fn reconnect(coordinator: &StateCoordinator<DisconnectingManager>) {
        coordinator.facade().inner.force_state(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
    }

    #[test]
    fn disconnect_during_acquire_latches_request() {
        let coordinator = DisconnectingManager::coordinator(FacadeOp::Acquire);
        assert_eq!(coordinator.acquire(false, None).unwrap(), Acquisition::Postponed);
        let session = coordinator.session();
        assert!(!session.acquired);
        assert!(session.acquire_requested);

        reconnect(&coordinator);
        assert!(coordinator.session().acquired);
        assert!(!coordinator.session().acquire_requested);
        assert_eq!(coordinator.facade().query_state(), DeviceState::Ready);
    }

    #[test]
    fn disconnect_during_start_resumes_playback_on_reconnect() {
        let coordinator = DisconnectingManager::coordinator(FacadeOp::SetSpeed);
        coordinator.acquire(false, None).unwrap();
        coordinator.start().unwrap();
        let session = coordinator.session();
        assert!(!session.acquired && !session.playing);
        assert!(session.acquire_requested && session.playback_requested);
        assert_eq!(coordinator.frame(&[0u8; 512]), 0);

        reconnect(&coordinator);
        let session = coordinator.session();
        assert!(session.acquired && session.playing);
        assert_eq!(coordinator.facade().query_state(), DeviceState::Streaming);
        assert_eq!(coordinator.frame(&[0u8; 512]), 512);
    }

    #[test]
    fn disconnect_during_relinquish_leaves_nothing_pending() {
        let coordinator = DisconnectingManager::coordinator(FacadeOp::Relinquish);
        coordinator.acquire(false, None).unwrap();
        assert!(coordinator.relinquish().is_clean());
        let session = coordinator.session();
        assert!(!session.acquire_requested && !session.playback_requested);

        reconnect(&coordinator);
        assert!(!coordinator.session().acquired);
        assert_eq!(coordinator.facade().inner.count_calls(|c| matches!(c, FacadeCall::Acquire { .. })), 1);
    }

    #[test]
    fn disconnect_during_stop_does_not_resume_playback() {
        let coordinator = DisconnectingManager::coordinator(FacadeOp::SetSpeed);
        coordinator.facade().fired.store(true, Ordering::SeqCst);
        coordinator.acquire(false, None).unwrap();
        coordinator.start().unwrap();
        assert!(coordinator.session().playing);

        coordinator.facade().fired.store(false, Ordering::SeqCst);
        assert!(coordinator.stop().is_clean());
        let session = coordinator.session();
        assert!(!session.playing && !session.playback_requested);
        assert!(session.acquire_requested);

        reconnect(&coordinator);
        let session = coordinator.session();
        assert!(session.acquired && !session.playing);
        assert_eq!(coordinator.facade().query_state(), DeviceState::Ready);
    }

    #[test]
    fn resync_replays_a_missed_disconnect() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);

        // the manager went through Disconnected but only Connected is observed
        manager.force_state(DeviceState::Connected);
        coordinator.on_state_changed(DeviceState::Connected);
        assert!(coordinator.session().acquired);

        coordinator.resync(DeviceState::Connected);
        let session = coordinator.session();
        assert!(session.acquired && session.playing);
        assert!(!session.acquire_requested && !session.playback_requested);
        assert_eq!(manager.query_state(), DeviceState::Streaming);
        assert_eq!(coordinator.frame(&[0u8; 256]), 256);
    }

    #[test]
    fn resync_with_matching_state_changes_nothing() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        let before = coordinator.session();
        coordinator.resync(DeviceState::Streaming);
        assert_eq!(coordinator.session(), before);
        assert!(manager.calls().is_empty());
    }

    #[test]
    fn reset_latched_while_playing_is_consumed_after_stop() {
        let (manager, coordinator) = coordinator(DeviceState::Connected);
        playing(&manager, &coordinator);
        coordinator.reset();
        assert_eq!(coordinator.frame(&[0u8; 256]), 256);
        assert!(coordinator.session().reset_requested);

        assert!(coordinator.stop().is_clean());
        assert_eq!(coordinator.frame(&[0u8; 256]), 256);
        assert_eq!(coordinator.frame(&[0u8; 256]), 0);
    }
}
