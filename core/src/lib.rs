pub mod definitions;
pub mod errors;
pub mod facade;
pub mod config;
pub mod coordinator;
pub mod manager_events;
pub mod lifecycle;
pub mod sink;
pub mod simulated;

mod session_state;

pub use config::SinkConfig;
pub use coordinator::{Acquisition, StateCoordinator};
pub use definitions::{AudioFormat, DeviceState, SampleFormat, StreamSpec};
pub use errors::{FacadeError, SinkError, Transition};
pub use facade::{Delivery, DeviceManagerFacade, ManagerEvent, ManagerEventReceiver, ManagerEventSender};
pub use session_state::SessionSnapshot;
pub use sink::BluetoothAudioSink;
pub use simulated::SimulatedDeviceManager;
