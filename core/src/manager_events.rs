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

use log::{debug, error, info};
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::coordinator::StateCoordinator;
use crate::definitions::DeviceState;
use crate::errors::SinkError;
use crate::facade::{Delivery, DeviceManagerFacade, ManagerEvent, ManagerEventReceiver, ManagerEventSender};

/// Handle to the task consuming manager events.
pub struct DispatcherHandle {
    join: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl DispatcherHandle {
    /// Asks the dispatcher to stop after the event it is currently handling.
    pub fn request_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Requests shutdown and waits for the dispatcher to finish.
    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        self.request_shutdown();
        self.join.await
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Reacts to the manager's service coming up or going away.
///
/// Once the service runs and answers with a known device state, the state listener is registered so
/// device transitions start flowing. Going away is only logged; the session is corrected by the next
/// state event.
pub fn handle_service_availability<F: DeviceManagerFacade + ?Sized>(
    facade: &F,
    running: bool,
    listener: &ManagerEventSender,
) -> Result<(), SinkError> {
    if !running {
        info!("Bluetooth audio sink service is now unavailable");
        return Ok(());
    }

    if facade.query_state() == DeviceState::Unknown {
        return Err(SinkError::ServiceFault);
    }

    info!("Bluetooth audio sink service now available");
    facade
        .register_state_listener(listener.clone())
        .map_err(|e| SinkError::facade("register_state_listener", e))
}

/// Spawns the task that feeds manager events to the coordinator, one at a time and in order.
///
/// Handlers make blocking facade calls, so each one runs on the blocking pool and is awaited
/// before the next event is taken. A coalesced state resync queries the device and reconciles the
/// session with what it reports.
pub fn spawn_dispatcher<F: DeviceManagerFacade + 'static>(
    coordinator: Arc<StateCoordinator<F>>,
    mut events: ManagerEventReceiver,
    listener: ManagerEventSender,
) -> DispatcherHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            select! {
                biased;
                _ = &mut shutdown_rx => {
                    debug!("Manager event dispatcher shutdown requested");
                    break;
                }
                delivery = events.recv() => {
                    match delivery {
                        Some(delivery) => dispatch(&coordinator, delivery, &listener).await,
                        None => {
                            debug!("Manager event channel closed; stopping dispatcher");
                            break;
                        }
                    }
                }
            }
        }
    });
    DispatcherHandle { join, shutdown_tx: Some(shutdown_tx) }
}

async fn dispatch<F: DeviceManagerFacade + 'static>(
    coordinator: &Arc<StateCoordinator<F>>,
    delivery: Delivery,
    listener: &ManagerEventSender,
) {
    debug!("Manager event: {:?}", delivery);
    let coordinator = coordinator.clone();
    let listener = listener.clone();
    let handled = tokio::task::spawn_blocking(move || match delivery {
        Delivery::Event(ManagerEvent::StateChanged(state)) => {
            coordinator.on_state_changed(state);
            Ok(())
        }
        Delivery::Event(ManagerEvent::ServiceAvailability { running }) => {
            handle_service_availability(coordinator.facade().as_ref(), running, &listener)
        }
        Delivery::StateResync => {
            let state = coordinator.facade().query_state();
            info!("Resynchronizing Bluetooth audio sink with device state {}", state);
            coordinator.resync(state);
            Ok(())
        }
    })
    .await;

    match handled {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to handle {:?}: {}", delivery, e),
        Err(e) => error!("Manager event handler for {:?} did not complete: {}", delivery, e),
    }
}
