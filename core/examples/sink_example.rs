// Drives a sink through connect, playback, a dropped connection and teardown against the
// simulated device manager.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use btaudiosink_core::{BluetoothAudioSink, DeviceState, SimulatedDeviceManager, SinkConfig, StreamSpec};
use log::info;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let manager = Arc::new(SimulatedDeviceManager::with_state(DeviceState::Unassigned));
    let sink = BluetoothAudioSink::new(manager.clone(), SinkConfig::from_env())?;

    manager.set_service_running(true);
    settle().await;

    // The pipeline prepares before any device is around; the request is latched.
    let format = sink.prepare(&StreamSpec::s16le(48_000, 2, 1920))?;
    info!("Negotiated {}", format);
    info!("Session before connect: {:?}", sink.session());

    manager.connect();
    settle().await;
    info!("Session after connect: {:?}", sink.session());

    let segment = vec![0u8; 1920];
    for _ in 0..5 {
        let written = sink.write(&segment);
        info!("Wrote {} bytes, delay {} frames", written, sink.delay());
    }

    manager.disconnect();
    settle().await;
    info!("Session after disconnect: {:?}", sink.session());

    manager.connect();
    settle().await;
    info!("Session after reconnect: {:?}", sink.session());

    let _ = sink.unprepare();
    let _ = sink.close();
    sink.shutdown().await;
    info!("Facade calls: {:#?}", manager.calls());
    Ok(())
}
