//! HTTP client for the venue gateway bridge.
//!
//! Prices and sizes travel as integer strings scaled by 10^18 ("x18"). Sell
//! amounts are negative and exit orders carry the reduce-only appendix bit.

use super::{
    Balance, OrderHandle, OrderRequest, OrderStatusReport, VenueError, VenueGateway,
    VenueOrderState, VenuePosition,
};
use crate::domain::{Decimal, PriceSnapshot, ProductId, Side, TimeMs};
use crate::engine::WalletAccount;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal as RustDecimal;
use std::str::FromStr;
use tracing::{debug, warn};

const X18_SCALE: i64 = 1_000_000_000_000_000_000;
const APPENDIX_REDUCE_ONLY: u32 = 2;

/// Venue gateway speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct RestVenueGateway {
    client: Client,
    base_url: String,
}

impl RestVenueGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder, account: &WalletAccount) -> RequestBuilder {
        builder.bearer_auth(account.credential().expose())
    }

    fn account_query(account: &WalletAccount) -> Vec<(&'static str, String)> {
        let mut query = vec![("address", account.address().to_string())];
        if let Some(subaccount) = account.subaccount() {
            query.push(("subaccount", subaccount.to_string()));
        }
        query
    }

    async fn send(&self, builder: RequestBuilder) -> Result<serde_json::Value, VenueError> {
        let response = builder
            .send()
            .await
            .map_err(|e| VenueError::NetworkError(e.to_string()))?;
        read_json(response).await
    }
}

/// Map an HTTP response onto the venue error taxonomy.
async fn read_json(response: Response) -> Result<serde_json::Value, VenueError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| VenueError::ParseError(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);

    Err(match status.as_u16() {
        400 | 422 => VenueError::Rejected(message),
        401 | 403 => VenueError::Unauthorized(message),
        404 => VenueError::NotFound(message),
        429 => VenueError::RateLimited,
        code => VenueError::HttpError {
            status: code,
            message,
        },
    })
}

fn scale() -> RustDecimal {
    RustDecimal::from(X18_SCALE)
}

/// Encode a decimal as an x18 integer string, truncating below 1e-18.
pub fn to_x18(value: Decimal) -> String {
    let scaled = (value.inner() * scale()).trunc();
    scaled.normalize().to_string()
}

/// Decode an x18 integer string.
pub fn from_x18(raw: &str) -> Result<Decimal, VenueError> {
    let scaled = RustDecimal::from_str(raw)
        .map_err(|e| VenueError::ParseError(format!("Invalid x18 value {}: {}", raw, e)))?;
    Ok(Decimal::new(scaled / scale()))
}

fn str_field<'a>(json: &'a serde_json::Value, field: &str) -> Result<&'a str, VenueError> {
    json.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| VenueError::ParseError(format!("Missing {} field", field)))
}

fn x18_field(json: &serde_json::Value, field: &str) -> Result<Decimal, VenueError> {
    from_x18(str_field(json, field)?)
}

fn optional_x18(json: &serde_json::Value, field: &str) -> Result<Option<Decimal>, VenueError> {
    match json.get(field).and_then(|v| v.as_str()) {
        Some(raw) => from_x18(raw).map(Some),
        None => Ok(None),
    }
}

fn parse_order_state(raw: &str) -> Result<VenueOrderState, VenueError> {
    match raw {
        "open" => Ok(VenueOrderState::Open),
        "partially_filled" => Ok(VenueOrderState::PartiallyFilled),
        "filled" => Ok(VenueOrderState::Filled),
        "cancelled" => Ok(VenueOrderState::Cancelled),
        "rejected" => Ok(VenueOrderState::Rejected),
        other => Err(VenueError::ParseError(format!(
            "Invalid order status: {}",
            other
        ))),
    }
}

/// Build the `/execute` payload for an order.
pub fn execute_payload(account: &WalletAccount, request: &OrderRequest) -> serde_json::Value {
    let amount = match request.side {
        Side::Long => request.size,
        Side::Short => -request.size,
    };
    let appendix = if request.reduce_only {
        APPENDIX_REDUCE_ONLY
    } else {
        0
    };
    serde_json::json!({
        "sender": account.address(),
        "subaccount": account.subaccount(),
        "productId": request.product_id.as_u32(),
        "priceX18": request.price.map(to_x18).unwrap_or_else(|| "0".to_string()),
        "amount": to_x18(amount),
        "appendix": appendix,
        "clientId": request.client_id,
        "kind": request.kind.as_str(),
        "leverage": request.leverage,
    })
}

fn parse_position(json: &serde_json::Value) -> Result<VenuePosition, VenueError> {
    let product_id = json
        .get("productId")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| VenueError::ParseError("Missing productId field".to_string()))?;
    Ok(VenuePosition {
        product_id: ProductId::new(product_id as u32),
        signed_size: x18_field(json, "amountX18")?,
        entry_price: optional_x18(json, "entryPriceX18")?,
    })
}

#[async_trait]
impl VenueGateway for RestVenueGateway {
    async fn get_price(&self, product_id: ProductId) -> Result<PriceSnapshot, VenueError> {
        let builder = self
            .client
            .get(self.url("ticker"))
            .query(&[("productId", product_id.as_u32())]);
        let json = self.send(builder).await?;

        let bid = x18_field(&json, "bidX18")?;
        let ask = x18_field(&json, "askX18")?;
        let mark = optional_x18(&json, "markX18")?.unwrap_or((bid + ask) / Decimal::from_i64(2));
        Ok(PriceSnapshot::new(product_id, bid, ask, mark, TimeMs::now()))
    }

    async fn place_order(
        &self,
        account: &WalletAccount,
        request: &OrderRequest,
    ) -> Result<OrderHandle, VenueError> {
        debug!(
            wallet = %account.id,
            product = %request.product_id,
            client_id = %request.client_id,
            kind = %request.kind,
            "Submitting order"
        );
        let builder = self
            .authed(self.client.post(self.url("execute")), account)
            .json(&execute_payload(account, request));
        let json = self.send(builder).await?;

        Ok(OrderHandle {
            venue_order_id: str_field(&json, "digest")?.to_string(),
            client_id: request.client_id.clone(),
        })
    }

    async fn cancel_order(
        &self,
        account: &WalletAccount,
        product_id: ProductId,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        let payload = serde_json::json!({
            "sender": account.address(),
            "subaccount": account.subaccount(),
            "productId": product_id.as_u32(),
            "digest": venue_order_id,
        });
        let builder = self
            .authed(self.client.post(self.url("cancel")), account)
            .json(&payload);
        self.send(builder).await.map(|_| ())
    }

    async fn order_status(
        &self,
        account: &WalletAccount,
        product_id: ProductId,
        client_id: &str,
    ) -> Result<OrderStatusReport, VenueError> {
        let mut query = Self::account_query(account);
        query.push(("productId", product_id.as_u32().to_string()));
        query.push(("clientId", client_id.to_string()));
        let builder = self
            .authed(self.client.get(self.url("order")), account)
            .query(&query);
        let json = self.send(builder).await?;

        Ok(OrderStatusReport {
            venue_order_id: str_field(&json, "digest")?.to_string(),
            client_id: client_id.to_string(),
            state: parse_order_state(str_field(&json, "status")?)?,
            filled_size: x18_field(&json, "filledX18")?.abs(),
            avg_fill_price: optional_x18(&json, "avgPriceX18")?,
        })
    }

    async fn get_positions(
        &self,
        account: &WalletAccount,
    ) -> Result<Vec<VenuePosition>, VenueError> {
        let builder = self
            .authed(self.client.get(self.url("positions")), account)
            .query(&Self::account_query(account));
        let json = self.send(builder).await?;

        let positions_json = json
            .get("positions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| VenueError::ParseError("Expected positions array".to_string()))?;

        let mut positions = Vec::new();
        for position_json in positions_json {
            match parse_position(position_json) {
                Ok(position) if !position.signed_size.is_zero() => positions.push(position),
                Ok(_) => {}
                Err(e) => {
                    // never drop a position silently
                    warn!("Failed to parse position: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(positions)
    }

    async fn get_balance(&self, account: &WalletAccount) -> Result<Balance, VenueError> {
        let builder = self
            .authed(self.client.get(self.url("subaccount")), account)
            .query(&Self::account_query(account));
        let json = self.send(builder).await?;

        Ok(Balance {
            total: x18_field(&json, "totalX18")?,
            available: x18_field(&json, "availableX18")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, WalletId};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_x18_encoding() {
        assert_eq!(to_x18(d("1")), "1000000000000000000");
        assert_eq!(to_x18(d("100.03")), "100030000000000000000");
        assert_eq!(to_x18(d("-0.1")), "-100000000000000000");
        assert_eq!(from_x18("100030000000000000000").unwrap(), d("100.03"));
        assert!(from_x18("abc").is_err());
    }

    #[test]
    fn test_execute_payload_sell_is_negative_and_reduce_only() {
        let account = WalletAccount::new(WalletId::new("main"), "0xabc").with_subaccount("default");
        let request = OrderRequest {
            client_id: "pk-1".to_string(),
            product_id: ProductId::new(2),
            side: Side::Short,
            size: d("0.5"),
            price: None,
            kind: OrderKind::Close,
            reduce_only: true,
            leverage: 3,
        };
        let payload = execute_payload(&account, &request);
        assert_eq!(payload["amount"], "-500000000000000000");
        assert_eq!(payload["priceX18"], "0");
        assert_eq!(payload["appendix"], 2);
        assert_eq!(payload["sender"], "0xabc");
        assert_eq!(payload["subaccount"], "default");
        assert_eq!(payload["clientId"], "pk-1");
    }

    #[test]
    fn test_parse_position() {
        let json = serde_json::json!({
            "productId": 4,
            "amountX18": "-2000000000000000000",
            "entryPriceX18": "3000000000000000000000"
        });
        let position = parse_position(&json).unwrap();
        assert_eq!(position.product_id, ProductId::new(4));
        assert_eq!(position.signed_size, d("-2"));
        assert_eq!(position.entry_price, Some(d("3000")));
    }

    #[test]
    fn test_parse_order_state() {
        assert_eq!(
            parse_order_state("partially_filled").unwrap(),
            VenueOrderState::PartiallyFilled
        );
        assert!(parse_order_state("weird").is_err());
    }
}
