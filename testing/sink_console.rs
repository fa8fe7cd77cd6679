// Line-driven console for poking a sink backed by the simulated device manager.
//
// Manager side:  service up|down, connect, disconnect, bad, restricted, unassign
// Pipeline side: open, prepare <rate> <channels> [segment], write [bytes], delay, reset,
//                unprepare, close
// Misc:          status, calls, quit
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btaudiosink_core::{
    BluetoothAudioSink, DeviceManagerFacade, DeviceState, SimulatedDeviceManager, SinkConfig, StreamSpec,
};
use log::info;

type Sink = BluetoothAudioSink<SimulatedDeviceManager>;

fn parse_arg<T: std::str::FromStr>(args: &[&str], index: usize, default: T) -> Result<T> {
    match args.get(index) {
        Some(raw) => raw.parse().map_err(|_| anyhow!("invalid argument {:?}", raw)),
        None => Ok(default),
    }
}

fn run_command(manager: &SimulatedDeviceManager, sink: &Sink, line: &str) -> Result<bool> {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = args.first() else { return Ok(true) };

    match *command {
        "service" => manager.set_service_running(args.get(1) != Some(&"down")),
        "connect" => manager.connect(),
        "disconnect" => manager.disconnect(),
        "bad" => manager.set_state(DeviceState::ConnectedBadDevice),
        "restricted" => manager.set_state(DeviceState::ConnectedRestricted),
        "unassign" => manager.set_state(DeviceState::Unassigned),
        "open" => println!("open: {:?}", sink.open()),
        "prepare" => {
            let spec = StreamSpec::s16le(parse_arg(&args, 1, 48_000)?, parse_arg(&args, 2, 2)?, parse_arg(&args, 3, 1920)?);
            println!("prepare: {:?}", sink.prepare(&spec));
        }
        "write" => {
            let len: usize = parse_arg(&args, 1, 1920)?;
            println!("write: {} of {} bytes", sink.write(&vec![0u8; len]), len);
        }
        "delay" => println!("delay: {} frames", sink.delay()),
        "reset" => sink.reset(),
        "unprepare" => println!("unprepare: {:?}", sink.unprepare()),
        "close" => println!("close: {:?}", sink.close()),
        "status" => println!("device {}, session {:#?}", manager.query_state(), sink.session()),
        "calls" => println!("{:#?}", manager.take_calls()),
        "quit" | "exit" => return Ok(false),
        other => println!("unknown command {:?}", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let manager = Arc::new(SimulatedDeviceManager::with_state(DeviceState::Unassigned));
    let sink = BluetoothAudioSink::new(manager.clone(), SinkConfig::from_env())?;
    info!("Simulated Bluetooth audio sink console ready");

    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        match run_command(&manager, &sink, line.trim()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {}", e),
        }
        // let the dispatcher catch up before the next prompt
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sink.shutdown().await;
    println!("Exiting...");
    Ok(())
}
