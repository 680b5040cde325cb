//! Fetches a screen through the resilient client.
//!
//! ```sh
//! SCREENS_URL=http://localhost:8080 cargo run --example screen_service -- welcome u1
//! ```
//!
//! With no service listening, retries are exhausted and the fallback payload
//! is served instead.

use kumiito::prelude::*;
use kumiito::transform::FieldSelector;
use kumiito::validate::RequiredFields;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kumiito::telemetry::init_tracing();

    let base = std::env::var("SCREENS_URL").unwrap_or_else(|_| "http://127.0.0.1:9".to_string());
    let mut args = std::env::args().skip(1);
    let screen_id = args.next().unwrap_or_else(|| "welcome".to_string());
    let user_id = args.next().unwrap_or_else(|| "u1".to_string());

    let config = ResilienceConfig::builder()
        .request_timeout(Duration::from_secs(2))
        .max_retries(2)
        .backoff(Duration::from_millis(50), Duration::from_millis(400))
        .fallback(200, r#"{"id":"offline","title":"Offline","blocks":[]}"#)
        .build()?;
    let client = Arc::new(ResilientClient::new("screens", config)?);

    let fetch = HttpStep::builder("fetch_screen", Arc::clone(&client))
        .get(format!("{base}/api/screens/${{screen_id}}"))
        .query("user_id", "${user_id}")
        .header("accept", "application/json")
        .transformer(Arc::new(FieldSelector::new(["id", "title", "blocks"])))
        .validator(Arc::new(RequiredFields::new(["id"])))
        .result_key("screen")
        .build()?;

    let flow = Flow::builder("screen")
        .timeout(Duration::from_secs(10))
        .step(fetch)
        .build()?;

    let ctx = ExecutionContext::new("screen");
    ctx.set("screen_id", screen_id);
    ctx.set("user_id", user_id);

    let result = flow.execute(&ctx).await;
    println!("circuit: {}", client.circuit_state());
    result.into_result()?;

    println!("metadata: {:?}", ctx.get(kumiito::HTTP_METADATA_KEY));
    println!("screen:   {:?}", ctx.get("screen"));
    Ok(())
}
