/**
 * Discovery Example
 *
 * Listens on UDP 6666/6667 for 30 seconds and prints every device that
 * announces itself.
 */
use futures_util::StreamExt;
use tokio::time::{Duration, timeout};
use tuyalink::Discovery;

#[tokio::main]
async fn main() -> tuyalink::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalink - Discovery ---");

    let discovery = Discovery::new()?;
    let stream = discovery.broadcasts();
    tokio::pin!(stream);
    discovery.start()?;

    let mut count = 0;
    let _ = timeout(Duration::from_secs(30), async {
        while let Some(msg) = stream.next().await {
            count += 1;
            println!(
                "[{}] Found Device: ID={}, IP={}, Version={}, Product={}",
                count, msg.gw_id, msg.ip, msg.version, msg.product_key
            );
        }
    })
    .await;

    discovery.stop();
    println!("[INFO] Listen finished. Broadcasts received: {count}");
    Ok(())
}
