//! Diagnostic commands against the exchange REST API.

use anyhow::{bail, Result};

use optroll_broker::{Credentials, ExchangePort};
use optroll_config::AppConfig;

use crate::runtime::build_exchange;

fn configured_credentials(config: &AppConfig, credential_id: i64) -> Result<Credentials> {
    let Some(entry) = config.credentials.iter().find(|c| c.id == credential_id) else {
        bail!("no credentials configured for id {credential_id}");
    };
    Ok(Credentials {
        api_key: entry.api_key.clone(),
        api_secret: entry.api_secret.clone(),
    })
}

/// Print the latest index price for an underlying.
pub async fn show_index_price(config: &AppConfig, symbol: &str) -> Result<()> {
    let exchange = build_exchange(config);
    let price = exchange.index_price(symbol).await?;
    println!("{symbol}: {price}");
    Ok(())
}

/// Print all open option positions for a configured credential.
pub async fn show_positions(config: &AppConfig, credential_id: i64) -> Result<()> {
    let exchange = build_exchange(config);
    let cred = configured_credentials(config, credential_id)?;
    let positions = exchange.positions(&cred).await?;
    if positions.is_empty() {
        println!("no open positions");
        return Ok(());
    }
    for position in positions {
        let side = position
            .side
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<26} {:<4} qty {:<12} entry {} mark {}",
            position.symbol,
            side,
            position.quantity,
            position
                .entry_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            position
                .mark_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}
