//! Ship stdin lines as events - demonstrates the runtime API.
//!
//! ```bash
//! TOIMITUS_HOSTS=localhost:5044 cargo run -p toimitus-runtime --example ship_stdin < app.log
//! ```

use tokio::io::{AsyncBufReadExt, BufReader};
use toimitus_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toimitus_runtime::run(|sender| async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            // JSON objects keep their fields, anything else becomes `message`
            let event = match serde_json::from_str::<Fields>(&line) {
                Ok(fields) => Event::new(fields),
                Err(_) => Event::default().field("message", line),
            };
            sender.publish(event).await?;
        }
        Ok(())
    })
    .await
}
