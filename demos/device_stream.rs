/**
 * Device Event Stream Example
 *
 * Connects to one device, prints every data point update for a minute and
 * toggles DP 1 once along the way.
 *
 * Set TUYA_ID, TUYA_KEY, TUYA_IP and optionally TUYA_VERSION (default 3.3).
 */
use futures_util::StreamExt;
use std::env;
use tokio::time::{Duration, sleep};
use tuyalink::{ConnectOptions, Device, DeviceEvent};

#[tokio::main]
async fn main() -> tuyalink::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let var = |name: &str| env::var(name).unwrap_or_default();
    let version = env::var("TUYA_VERSION").unwrap_or_else(|_| "3.3".into());

    // 1. Build the device handle
    let device = Device::builder(var("TUYA_ID"), var("TUYA_KEY"))
        .ip(var("TUYA_IP"))
        .version(version.parse()?)
        .build()?;

    // 2. Subscribe before connecting so nothing is missed
    let stream = device.events();
    tokio::pin!(stream);
    device.connect(ConnectOptions::default()).await?;
    println!("[INFO] Connecting to {} ({})...", device.id(), device.version());

    let timeout = sleep(Duration::from_secs(60));
    tokio::pin!(timeout);
    let mut toggled = false;

    // 3. Process events until the timeout
    loop {
        tokio::select! {
            Some(event) = stream.next() => match event {
                DeviceEvent::Connected => println!("[EVENT] Connected"),
                DeviceEvent::Disconnected => println!("[EVENT] Disconnected"),
                DeviceEvent::StateChanged(dps) => {
                    println!("[EVENT] State: {}", serde_json::Value::Object(dps.clone()));
                    if !toggled {
                        toggled = true;
                        let on = dps.get("1").and_then(|v| v.as_bool()).unwrap_or(false);
                        device.set_value(1, !on).await?;
                    }
                }
                DeviceEvent::Error(e) => eprintln!("[ERROR] {} (code {})", e, e.code()),
                _ => {}
            },
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    device.disconnect().await
}
