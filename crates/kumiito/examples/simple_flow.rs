//! Offline flow: aggregation, a conditional branch and payload shaping.

use kumiito::prelude::*;
use kumiito::transform::{FieldSelector, Flatten, SequentialChain};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kumiito::telemetry::init_tracing();

    let home = AggregationStep::builder("home")
        .required(
            "user",
            FnStep::new("load_user", |ctx| {
                let id = ctx.get_string("user_id")?;
                ctx.set("user", json!({"id": id, "tier": "gold"}));
                Ok(())
            }),
        )
        .optional(
            "offers",
            FnStep::new("load_offers", |_| {
                Err(FlowError::StepError {
                    step_name: "load_offers".into(),
                    details: "offers service unavailable".into(),
                })
            }),
            json!([]),
        )
        .build()?;

    let shape = SequentialChain::new("mobile_payload")
        .then(Arc::new(FieldSelector::new(["home"])))
        .then(Arc::new(Flatten::new()));

    let flow = Flow::builder("home_screen")
        .description("assembles the home screen payload")
        .step(home)
        .choice(
            "gold_banner",
            |ctx| ctx.get_path("home.user.tier") == Some(json!("gold")),
            vec![Stage::step(FnStep::new("add_banner", |ctx| {
                ctx.set("banner", "Welcome back, gold member");
                Ok(())
            }))],
        )
        .transform("shape", shape)
        .build()?;

    let ctx = ExecutionContext::new("home_screen");
    ctx.set("user_id", "u1");

    let result = flow.execute(&ctx).await;
    for stage in &result.stages {
        println!(
            "{:<12} {:?} success={} skipped={} {:?}",
            stage.name, stage.kind, stage.success, stage.skipped, stage.duration
        );
    }
    result.into_result()?;

    println!("{}", serde_json::to_string_pretty(&ctx.snapshot())?);
    Ok(())
}
