//! Webull broker over `webull_unofficial`: login, positions, expirations, chains, option orders.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{error, info, warn};
use webull_unofficial::{
    error::WebullError,
    models::{OptionContract, OrderAction, Quote, TimeInForce as WbTif},
    WebullClient,
};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::types::{
    BrokerPosition, LongOption, OptionQuote, OptionType, OrderResult, OrderSide, OrderSpec,
    OrderStatus, ShortCall, TimeInForce,
};
use crate::utils::{parse_expiry_date, same_strike, sanitize_symbol};

/// Quote requests in flight while building one chain.
const QUOTE_CONCURRENCY: usize = 4;

pub struct WebullBroker {
    client: WebullClient,
    pub is_live: bool,
    /// client order id -> Webull order id, for orders this process placed.
    placed: Mutex<HashMap<String, String>>,
}

impl WebullBroker {
    /// Login with the builder API, falling back to an interactive MFA prompt.
    ///
    /// Live mode also fetches the trade token with the trading PIN.
    pub async fn login(
        username: &str,
        password: &str,
        region: Option<i32>,
        mode: &str,
        trading_pin: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut client = match mode {
            "live" => WebullClient::new_live(region).context("create live client")?,
            _ => WebullClient::new_paper(region).context("create paper client")?,
        };

        info!(
            "Webull login attempt: user(partial)={}, mode={}, region={:?}",
            mask_user(username),
            mode,
            region
        );

        let first = client
            .login_with()
            .username(username)
            .password(password)
            .await;

        let need_mfa = match first {
            Ok(_) => {
                info!("Webull login success (no MFA required).");
                false
            }
            Err(WebullError::MfaRequired) => {
                info!("MFA required by Webull.");
                true
            }
            Err(WebullError::AuthenticationError(_)) => {
                // Some regions answer a generic auth error when MFA is what they want.
                error!("AuthenticationError on first attempt; will try interactive MFA.");
                true
            }
            Err(e) => {
                error!("Webull login error: {:#?}", e);
                return Err(e).context("webull login failed");
            }
        };

        if need_mfa {
            let code = prompt_mfa("Enter the 6-digit Webull verification code: ").await?;
            client
                .login_with()
                .username(username)
                .password(password)
                .mfa(code.trim())
                .await
                .map_err(|e| {
                    error!("Webull login with MFA failed: {:#?}", e);
                    e
                })
                .context("webull login (with MFA) failed")?;
            info!("Webull login success (with MFA).");
        }

        let is_live = mode == "live";
        if is_live {
            let pin = trading_pin.context("WEBULL_TRADING_PIN required for live")?;
            client
                .get_trade_token(pin)
                .await
                .context("get_trade_token failed")?;
            info!("Trade token acquired for live trading.");
        }

        Ok(Self {
            client,
            is_live,
            placed: Mutex::new(HashMap::new()),
        })
    }

    async fn stock_ticker_id(&self, symbol: &str) -> Result<i64, BrokerError> {
        let found = self.client.find_ticker(symbol).await.map_err(wb_err)?;
        found
            .first()
            .map(|t| t.ticker_id)
            .ok_or_else(|| BrokerError::NotFound(format!("ticker {symbol}")))
    }

    async fn contracts(&self, symbol: &str) -> Result<Vec<OptionContract>, BrokerError> {
        self.client.get_options(symbol).await.map_err(wb_err)
    }

    async fn find_contract(
        &self,
        symbol: &str,
        expiration: NaiveDate,
        strike: f64,
        option_type: OptionType,
    ) -> Result<OptionContract, BrokerError> {
        self.contracts(symbol)
            .await?
            .into_iter()
            .find(|c| {
                OptionType::parse(&c.option_type) == Some(option_type)
                    && same_strike(c.strike_price, strike)
                    && parse_expiry_date(&c.expiration_date) == Some(expiration)
            })
            .ok_or_else(|| {
                BrokerError::NotFound(format!(
                    "option contract {symbol} {expiration} {strike} {option_type:?}"
                ))
            })
    }

    async fn quote(&self, ticker_id: i64) -> Result<Quote, BrokerError> {
        self.client
            .get_quotes(&ticker_id.to_string())
            .await
            .map_err(wb_err)
    }

    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let raw = self.client.get_positions().await.map_err(wb_err)?;
        let v = serde_json::to_value(raw).map_err(|e| BrokerError::Other(e.to_string()))?;
        Ok(parse_holdings(&v))
    }

    fn remember(&self, client_order_id: &str, broker_order_id: &str) {
        let mut placed = self.placed.lock().unwrap_or_else(|p| p.into_inner());
        placed.insert(client_order_id.to_string(), broker_order_id.to_string());
    }

    fn placed_id(&self, client_order_id: &str) -> Option<String> {
        let placed = self.placed.lock().unwrap_or_else(|p| p.into_inner());
        placed.get(client_order_id).cloned()
    }
}

#[async_trait(?Send)]
impl Broker for WebullBroker {
    fn name(&self) -> &str {
        if self.is_live {
            "webull-live"
        } else {
            "webull-paper"
        }
    }

    async fn get_position(&self, symbol: &str) -> Result<BrokerPosition, BrokerError> {
        let symbol = sanitize_symbol(symbol);
        let mut out = BrokerPosition::default();
        for h in self.holdings().await? {
            match h {
                Holding::Stock {
                    symbol: s,
                    shares,
                    avg_cost,
                } if s.eq_ignore_ascii_case(&symbol) => {
                    out.shares += shares.max(0.0).floor() as u32;
                    out.cost_basis = avg_cost.or(out.cost_basis);
                }
                Holding::Option {
                    underlying,
                    strike,
                    option_type,
                    expiration,
                    quantity,
                    avg_cost,
                } if underlying.eq_ignore_ascii_case(&symbol) => {
                    if quantity < 0 && option_type == OptionType::Call {
                        out.short_calls.push(ShortCall {
                            symbol: symbol.clone(),
                            strike,
                            expiration,
                            quantity: quantity.unsigned_abs() as u32,
                            avg_price: avg_cost,
                        });
                    } else if quantity > 0 {
                        out.long_options.push(LongOption {
                            symbol: symbol.clone(),
                            strike,
                            expiration,
                            option_type,
                            quantity: quantity as u32,
                            avg_cost,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn symbols_with_short_calls(&self) -> Result<Vec<String>, BrokerError> {
        let set: BTreeSet<String> = self
            .holdings()
            .await?
            .into_iter()
            .filter_map(|h| match h {
                Holding::Option {
                    underlying,
                    option_type: OptionType::Call,
                    quantity,
                    ..
                } if quantity < 0 => Some(sanitize_symbol(&underlying)),
                _ => None,
            })
            .collect();
        Ok(set.into_iter().collect())
    }

    async fn get_reference_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let tid = self.stock_ticker_id(symbol).await?;
        let q = self.quote(tid).await?;
        if let (Some(bid), Some(ask)) = (q.bid, q.ask) {
            if ask > 0.0 && bid > 0.0 {
                return Ok((bid + ask) / 2.0);
            }
        }
        Ok(q.close)
    }

    async fn list_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, BrokerError> {
        let dates: BTreeSet<NaiveDate> = self
            .contracts(symbol)
            .await?
            .iter()
            .filter_map(|c| parse_expiry_date(&c.expiration_date))
            .collect();
        Ok(dates.into_iter().collect())
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>, BrokerError> {
        let wanted: Vec<(i64, f64, OptionType)> = self
            .contracts(symbol)
            .await?
            .into_iter()
            .filter(|c| parse_expiry_date(&c.expiration_date) == Some(expiration))
            .filter_map(|c| {
                OptionType::parse(&c.option_type).map(|t| (c.ticker_id, c.strike_price, t))
            })
            .collect();

        let quotes: Vec<OptionQuote> = stream::iter(wanted)
            .map(|(tid, strike, option_type)| async move {
                match self.quote(tid).await {
                    Ok(q) => OptionQuote {
                        strike,
                        option_type,
                        bid: q.bid,
                        ask: q.ask,
                    },
                    Err(e) => {
                        warn!("{} {} {:.2}: quote unavailable: {}", symbol, expiration, strike, e);
                        OptionQuote {
                            strike,
                            option_type,
                            bid: None,
                            ask: None,
                        }
                    }
                }
            })
            .buffered(QUOTE_CONCURRENCY)
            .collect()
            .await;
        Ok(quotes)
    }

    async fn submit_order(&self, order: &OrderSpec) -> Result<OrderResult, BrokerError> {
        let contract = self
            .find_contract(&order.symbol, order.expiration, order.strike, order.option_type)
            .await?;
        let action = match order.side {
            OrderSide::BuyToClose => OrderAction::Buy,
            OrderSide::SellToOpen => OrderAction::Sell,
        };
        let tif = match order.time_in_force {
            TimeInForce::Day => WbTif::Day,
            TimeInForce::GoodTillCancel => WbTif::GoodTillCancel,
        };
        let qty = f64::from(order.quantity);
        let placed = match order.limit_price {
            Some(limit) => {
                self.client
                    .place_limit_order_with(limit)
                    .ticker_id(contract.ticker_id)
                    .quantity(qty)
                    .action(action)
                    .time_in_force(tif)
                    .await
            }
            None => {
                self.client
                    .place_market_order_with()
                    .ticker_id(contract.ticker_id)
                    .quantity(qty)
                    .action(action)
                    .time_in_force(tif)
                    .await
            }
        };
        let order_id = placed.map_err(wb_err)?;
        self.remember(&order.client_order_id, &order_id);
        Ok(OrderResult::with_status(OrderStatus::Submitted, Some(order_id)))
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        let arr = self.client.get_orders(None).await.map_err(wb_err)?;
        let v = serde_json::to_value(arr).map_err(|e| BrokerError::Other(e.to_string()))?;
        parse_order(&v, broker_order_id)
            .ok_or_else(|| BrokerError::NotFound(format!("order {broker_order_id}")))
    }

    /// Webull assigns its own ids and does not echo ours, so only orders whose placement
    /// returned an id can be found. Anything else is reported as undeterminable.
    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        match self.placed_id(client_order_id) {
            Some(id) => self.get_order_status(&id).await.map(Some),
            None => Err(BrokerError::Other(format!(
                "order {client_order_id} has no webull id; cannot confirm whether it was placed"
            ))),
        }
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.client
            .cancel_order(broker_order_id)
            .await
            .map_err(wb_err)?;
        Ok(())
    }
}

fn wb_err(e: impl Display) -> BrokerError {
    BrokerError::classify(format!("{e:#}"))
}

/// One row of the Webull positions payload.
#[derive(Debug, Clone, PartialEq)]
enum Holding {
    Stock {
        symbol: String,
        shares: f64,
        avg_cost: Option<f64>,
    },
    Option {
        underlying: String,
        strike: f64,
        option_type: OptionType,
        expiration: NaiveDate,
        /// Negative for short positions.
        quantity: i64,
        avg_cost: Option<f64>,
    },
}

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_holdings(v: &Value) -> Vec<Holding> {
    let mut out = Vec::new();
    let Some(arr) = v.as_array() else {
        return out;
    };
    for it in arr {
        let avg_cost = it
            .get("cost")
            .or_else(|| it.get("avgPrice"))
            .or_else(|| it.get("costPrice"))
            .and_then(num)
            .filter(|c| *c > 0.0);
        let qty = it.get("position").and_then(num).unwrap_or(0.0);

        let strike = it
            .get("strikePrice")
            .or_else(|| it.get("strike"))
            .and_then(num);
        if let Some(strike) = strike {
            let underlying = it
                .get("underlyingSymbol")
                .or_else(|| it.get("symbol"))
                .and_then(Value::as_str);
            let option_type = it
                .get("callOrPut")
                .or_else(|| it.get("putCall"))
                .and_then(Value::as_str)
                .and_then(OptionType::parse);
            let expiration = it
                .get("expireDate")
                .or_else(|| it.get("expirationDate"))
                .or_else(|| it.get("expire_date"))
                .and_then(Value::as_str)
                .and_then(parse_expiry_date);
            match (underlying, option_type, expiration) {
                (Some(u), Some(t), Some(e)) => out.push(Holding::Option {
                    underlying: u.to_string(),
                    strike,
                    option_type: t,
                    expiration: e,
                    quantity: qty.round() as i64,
                    avg_cost,
                }),
                _ => warn!("Skipping option position with missing fields: {}", it),
            }
            continue;
        }

        if let Some(sym) = it
            .get("ticker")
            .and_then(|t| t.get("symbol"))
            .and_then(Value::as_str)
        {
            out.push(Holding::Stock {
                symbol: sym.to_string(),
                shares: qty,
                avg_cost,
            });
        }
    }
    out
}

fn parse_order(v: &Value, order_id: &str) -> Option<OrderResult> {
    let it = v.as_array()?.iter().find(|it| {
        let oid = ["orderId", "order_id", "orderIdStr"]
            .iter()
            .find_map(|k| match it.get(*k)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        oid.as_deref() == Some(order_id)
    })?;

    let status_str = it
        .get("status")
        .or_else(|| it.get("orderStatus"))
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    let status = match status_str.to_ascii_uppercase().as_str() {
        "WORKING" | "OPEN" | "PENDING" | "SUBMITTED" => OrderStatus::Submitted,
        "PARTIALLY_FILLED" | "PARTIAL" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" => OrderStatus::Canceled,
        "REJECTED" | "FAILED" => OrderStatus::Rejected,
        _ => OrderStatus::Unknown,
    };
    let filled_qty = it
        .get("filledQuantity")
        .or_else(|| it.get("filledQty"))
        .or_else(|| it.get("filled_quantity"))
        .and_then(num)
        .unwrap_or(0.0);
    let avg_fill_price = it
        .get("filledAvgPrice")
        .or_else(|| it.get("avgFillPrice"))
        .or_else(|| it.get("avg_fill_price"))
        .and_then(num)
        .filter(|p| *p > 0.0);

    Some(OrderResult {
        status,
        broker_order_id: Some(order_id.to_string()),
        filled_price: avg_fill_price,
        filled_quantity: filled_qty.max(0.0).round() as u32,
        message: (status == OrderStatus::Unknown).then(|| format!("webull status {status_str}")),
    })
}

/// Prompt MFA code from CLI using a blocking read on a dedicated blocking thread.
async fn prompt_mfa(prompt: &str) -> anyhow::Result<String> {
    use std::io::{self, Write};
    let prompt = prompt.to_string();
    let code = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        print!("{}", prompt);
        let _ = io::stdout().flush();
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        let s = buf.trim().to_string();
        if s.is_empty() {
            return Err(anyhow!("Empty MFA code"));
        }
        Ok(s)
    })
    .await
    .map_err(|e| anyhow!("spawn_blocking join error: {}", e))??;
    Ok(code)
}

/// Print first two chars, then mask the rest (for logs only).
fn mask_user(u: &str) -> String {
    let mut cs = u.chars();
    let a = cs.next().unwrap_or('*');
    let b = cs.next().unwrap_or('*');
    format!("{}{}****", a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn holdings_split_stock_and_options() {
        let v = json!([
            { "ticker": { "symbol": "AAPL" }, "position": "500", "cost": "150.25" },
            {
                "underlyingSymbol": "AAPL", "strikePrice": "105", "callOrPut": "CALL",
                "expireDate": "2025-01-17", "position": -2, "cost": 1.3
            },
            {
                "underlyingSymbol": "AAPL", "strikePrice": 90.0, "callOrPut": "P",
                "expireDate": "2025-02-21", "position": 1
            }
        ]);
        let h = parse_holdings(&v);
        assert_eq!(
            h[0],
            Holding::Stock {
                symbol: "AAPL".into(),
                shares: 500.0,
                avg_cost: Some(150.25)
            }
        );
        assert!(matches!(
            h[1],
            Holding::Option { quantity: -2, option_type: OptionType::Call, .. }
        ));
        assert!(matches!(
            h[2],
            Holding::Option { quantity: 1, option_type: OptionType::Put, avg_cost: None, .. }
        ));
    }

    #[test]
    fn order_status_is_mapped() {
        let v = json!([
            { "orderId": 123, "status": "Filled", "filledQuantity": "2", "filledAvgPrice": "1.15" },
            { "orderId": "456", "status": "Working" }
        ]);
        let r = parse_order(&v, "123").unwrap();
        assert_eq!(r.status, OrderStatus::Filled);
        assert_eq!(r.filled_quantity, 2);
        assert_eq!(r.filled_price, Some(1.15));
        assert_eq!(parse_order(&v, "456").unwrap().status, OrderStatus::Submitted);
        assert!(parse_order(&v, "789").is_none());
    }

    #[test]
    fn user_is_masked() {
        assert_eq!(mask_user("jdoe@example.com"), "jd****");
        assert_eq!(mask_user(""), "******");
    }
}
