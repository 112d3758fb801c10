//! Power-user example - explicit config, shared registry, confirmed sends.
//!
//! ```bash
//! cargo run -p toimitus-runtime --example custom_shipper
//! ```

use prometheus::Registry;
use std::time::Duration;
use toimitus_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config {
        hosts: vec!["localhost:5044".into(), "localhost:5045".into()],
        bulk_max_size: 512,
        flush_interval: Duration::from_millis(200),
        stall_policy: StallPolicy::Rehandback,
        ..Config::default()
    };
    toimitus_runtime::init_tracing(&config);

    let registry = Registry::new();
    let shipper = Shipper::new(config).registry(registry.clone()).start()?;

    let events = (0..1000)
        .map(|i| Event::default().field("seq", i).field("message", "hello"))
        .collect();
    match shipper.sender().publish_bulk_confirmed(events).await {
        Ok(()) => println!("all events acknowledged"),
        Err(e) => eprintln!("delivery failed: {e}"),
    }

    print!("{}", toimitus_output::metrics::gather(&registry));
    shipper.shutdown().await;
    Ok(())
}
