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

use std::sync::{Arc, Mutex, Once, OnceLock, PoisonError, Weak};

use log::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::coordinator::StateCoordinator;
use crate::errors::SinkError;
use crate::facade::{DeviceManagerFacade, ManagerEventSender};
use crate::manager_events::{spawn_dispatcher, DispatcherHandle};

static EXIT_HOOK: Once = Once::new();

type ExitRegistry = Mutex<Vec<Weak<dyn DeviceManagerFacade>>>;

/// Facades still alive at process exit get disposed by the exit hook.
fn exit_registry() -> &'static ExitRegistry {
    static REGISTRY: OnceLock<ExitRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn facade_addr<F: ?Sized>(facade: *const F) -> *const () {
    facade.cast::<()>()
}

fn track_for_exit(facade: Arc<dyn DeviceManagerFacade>) {
    let mut registry = exit_registry().lock().unwrap_or_else(PoisonError::into_inner);
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(&facade));
}

fn untrack_for_exit(facade: *const ()) {
    let mut registry = exit_registry().lock().unwrap_or_else(PoisonError::into_inner);
    registry.retain(|weak| weak.strong_count() > 0 && facade_addr(weak.as_ptr()) != facade);
}

fn is_tracked_for_exit(facade: *const ()) -> bool {
    let registry = exit_registry().lock().unwrap_or_else(PoisonError::into_inner);
    registry.iter().any(|weak| weak.strong_count() > 0 && facade_addr(weak.as_ptr()) == facade)
}

extern "C" fn dispose_on_exit() {
    let facades: Vec<Arc<dyn DeviceManagerFacade>> = {
        let mut registry = exit_registry().lock().unwrap_or_else(PoisonError::into_inner);
        registry.drain(..).filter_map(|weak| weak.upgrade()).collect()
    };
    for facade in facades {
        facade.dispose();
    }
}

/// Installs the process-exit hook. Only the first call installs anything.
pub(crate) fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `dispose_on_exit` is a plain `extern "C" fn()` with no captured state.
        let rc = unsafe { libc::atexit(dispose_on_exit) };
        if rc == 0 {
            debug!("Process-exit hook for Bluetooth audio sink installed");
        } else {
            warn!("Failed to install process-exit hook ({})", rc);
        }
    });
}

/// One-time wiring of a sink to its device manager.
///
/// Starting registers the service listener, starts the event dispatcher and arranges for the
/// facade to be disposed at process exit. Teardown unregisters both listeners and disposes the
/// facade; it does not relinquish the device.
pub struct SinkLifecycle<F: DeviceManagerFacade + 'static> {
    facade: Arc<F>,
    dispatcher: Option<DispatcherHandle>,
    torn_down: bool,
}

impl<F: DeviceManagerFacade + 'static> SinkLifecycle<F> {
    /// Fails with [`SinkError::NotRunning`] outside a tokio runtime, before touching the facade.
    pub fn start(coordinator: Arc<StateCoordinator<F>>, config: &SinkConfig) -> Result<Self, SinkError> {
        if tokio::runtime::Handle::try_current().is_err() {
            error!("No tokio runtime to run the manager event dispatcher on");
            return Err(SinkError::NotRunning);
        }
        let facade = coordinator.facade().clone();

        install_exit_hook();
        track_for_exit(facade.clone());

        let (listener, events) = ManagerEventSender::channel(config.event_capacity);
        let dispatcher = spawn_dispatcher(coordinator, events, listener.clone());

        match facade.register_service_listener(listener) {
            Ok(()) => info!("Registered for Bluetooth audio sink service availability"),
            Err(e) => error!("Failed to register Bluetooth audio sink service listener: {}", e),
        }

        Ok(Self { facade, dispatcher: Some(dispatcher), torn_down: false })
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Err(e) = self.facade.unregister_state_listener() {
            warn!("Failed to unregister state listener: {}", e);
        }
        if let Err(e) = self.facade.unregister_service_listener() {
            warn!("Failed to unregister service listener: {}", e);
        }
        self.facade.dispose();
        untrack_for_exit(facade_addr(Arc::as_ptr(&self.facade)));
        debug!("Bluetooth audio sink lifecycle torn down");
    }

    /// Tears down and waits for the dispatcher to stop.
    pub async fn shutdown(mut self) {
        self.teardown();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.shutdown().await {
                error!("Manager event dispatcher ended abnormally: {}", e);
            }
        }
    }
}

impl<F: DeviceManagerFacade + 'static> Drop for SinkLifecycle<F> {
    fn drop(&mut self) {
        self.teardown();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::DeviceState;
    use crate::simulated::{FacadeCall, FacadeOp, SimulatedDeviceManager};

    fn lifecycle_for(manager: &Arc<SimulatedDeviceManager>) -> SinkLifecycle<SimulatedDeviceManager> {
        let config = SinkConfig::default();
        let coordinator = Arc::new(StateCoordinator::new(manager.clone(), &config));
        SinkLifecycle::start(coordinator, &config).unwrap()
    }

    fn addr(manager: &Arc<SimulatedDeviceManager>) -> *const () {
        facade_addr(Arc::as_ptr(manager))
    }

    #[tokio::test]
    async fn start_registers_service_listener_and_tracks_facade() {
        let manager = Arc::new(SimulatedDeviceManager::with_state(DeviceState::Unassigned));
        let lifecycle = lifecycle_for(&manager);
        assert!(manager.has_service_listener());
        assert!(is_tracked_for_exit(addr(&manager)));
        assert!(EXIT_HOOK.is_completed());
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_unregisters_disposes_and_untracks() {
        let manager = Arc::new(SimulatedDeviceManager::with_state(DeviceState::Connected));
        let lifecycle = lifecycle_for(&manager);
        manager.set_service_running(true);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(manager.has_state_listener());

        manager.take_calls();
        lifecycle.shutdown().await;
        assert_eq!(
            manager.calls(),
            vec![FacadeCall::UnregisterStateListener, FacadeCall::UnregisterServiceListener, FacadeCall::Dispose]
        );
        assert!(manager.is_disposed());
        assert!(!is_tracked_for_exit(addr(&manager)));
    }

    #[tokio::test]
    async fn drop_tears_down_exactly_once() {
        let manager = Arc::new(SimulatedDeviceManager::new());
        drop(lifecycle_for(&manager));
        assert_eq!(manager.count_calls(|c| *c == FacadeCall::Dispose), 1);
        assert!(!manager.calls().iter().any(|c| *c == FacadeCall::Relinquish));
    }

    #[tokio::test]
    async fn failed_service_registration_is_not_fatal() {
        let manager = Arc::new(SimulatedDeviceManager::new());
        manager.fail(FacadeOp::RegisterServiceListener);
        let lifecycle = lifecycle_for(&manager);
        assert!(!manager.has_service_listener());
        lifecycle.shutdown().await;
        assert!(manager.is_disposed());
    }

    #[test]
    fn start_outside_runtime_is_refused() {
        let manager = Arc::new(SimulatedDeviceManager::new());
        let config = SinkConfig::default();
        let coordinator = Arc::new(StateCoordinator::new(manager.clone(), &config));
        assert!(matches!(SinkLifecycle::start(coordinator, &config), Err(SinkError::NotRunning)));
        assert!(manager.calls().is_empty());
        assert!(!is_tracked_for_exit(addr(&manager)));
    }

    #[test]
    fn exit_hook_installs_once() {
        install_exit_hook();
        install_exit_hook();
        assert!(EXIT_HOOK.is_completed());
    }
}
