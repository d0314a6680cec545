//! Connects to a controller, prints state changes and polls stage position.
//!
//! ```text
//! cargo run -p scopelink --example status-monitor -- 127.0.0.1 5000
//! ```

use std::time::Duration;

use scopelink::frame::codes::{STAGE_POSITION_GET, SYSTEM_STATE_CHANGED};
use scopelink::{ClientConfig, CommandClient, Reply};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let ip = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().as_deref().unwrap_or("5000").parse()?;

    let client = CommandClient::with_config(ClientConfig::default());
    client.connect(&ip, port)?;

    client.register_callback(SYSTEM_STATE_CHANGED, |message| {
        println!("state -> {}", message.payload_str());
    });

    for _ in 0..5 {
        match client.request(STAGE_POSITION_GET, &[0], 0.0, &[], Duration::from_secs(2))? {
            Reply::Received(message) => {
                for (axis, value) in message.axis_values() {
                    println!("{axis}: {value:.3}");
                }
            }
            Reply::TimedOut { after, .. } => println!("no position reply after {after:?}"),
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    println!("{:#?}", client.stats());
    client.disconnect();
    Ok(())
}
