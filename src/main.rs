//! Entry point. Config + logging, Webull login, then one engine command.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Local;
use dotenvy::dotenv;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tiered_calls::config::AppConfig;
use tiered_calls::ledger::CostBasisLedger;
use tiered_calls::webull_client::WebullBroker;
use tiered_calls::TieredCallEngine;

const USAGE: &str = "usage: tiered-calls <plan|execute|rolls|roll-execute|basis> [SYMBOL]";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().context(USAGE)?;
    let symbol = args.next();

    let cfg = AppConfig::load("config.yaml").context("load config.yaml")?;
    let ledger = Arc::new(CostBasisLedger::open(&cfg.ledger.path)?);

    if command == "basis" {
        let symbol = symbol.context("basis needs a SYMBOL")?;
        let record = ledger.summarize(&symbol).await?;
        return print_json(&record);
    }

    let wb_user = std::env::var("WEBULL_USERNAME")?;
    let wb_pass = std::env::var("WEBULL_PASSWORD")?;
    let wb_pin = std::env::var("WEBULL_TRADING_PIN").ok(); // live only
    let wb = WebullBroker::login(
        &wb_user,
        &wb_pass,
        cfg.webull.region,
        &cfg.webull.mode,
        wb_pin.as_deref(),
    )
    .await?;
    info!("Webull mode: {}", if wb.is_live { "live" } else { "paper" });

    let engine = TieredCallEngine::new(Arc::new(wb), ledger, cfg.exec.clone());
    let today = Local::now().date_naive();
    info!(
        "Running {} on {} (broker={}, dry_run={})",
        command,
        today,
        engine.broker_name(),
        cfg.exec.dry_run
    );

    match command.as_str() {
        "plan" => {
            let symbol = symbol.context("plan needs a SYMBOL")?;
            let plan = engine
                .plan_tiered_strategy(&symbol, &cfg.strategy, today)
                .await?;
            print_json(&plan)
        }
        "execute" => {
            let symbol = symbol.context("execute needs a SYMBOL")?;
            let plan = engine
                .plan_tiered_strategy(&symbol, &cfg.strategy, today)
                .await?;
            let result = engine.execute_plan(plan).await?;
            print_json(&result)
        }
        "rolls" => {
            let plan = engine
                .find_and_plan_rolls(symbol.as_deref(), &cfg.strategy, today)
                .await?;
            print_json(&plan)
        }
        "roll-execute" => {
            let plan = engine
                .find_and_plan_rolls(symbol.as_deref(), &cfg.strategy, today)
                .await?;
            if plan.is_empty() {
                info!("No rolls to execute");
            }
            let result = engine.execute_roll_plan(plan).await?;
            print_json(&result)
        }
        other => bail!("unknown command {other:?}; {USAGE}"),
    }
}

fn print_json<T: Serialize>(v: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
