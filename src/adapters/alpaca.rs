//! Alpaca-flavor envelopes: `T` discriminator (`t`=trade, `q`=quote,
//! `b`=minute bar, `trade_update`=order lifecycle), RFC3339 timestamps.

use crate::event::{CorporateActionKind, Event, EventPayload, OrderUpdateKind};
use chrono::{DateTime, Utc};
use serde_json::json;

fn rfc3339(ts_ns: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts_ns / 1_000_000_000, (ts_ns % 1_000_000_000) as u32)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
        .to_rfc3339()
}

pub fn format(event: &Event) -> Vec<u8> {
    let symbol = event.symbol.as_str();
    let value = match &event.payload {
        EventPayload::Trade(trade) => json!({
            "T": "t",
            "S": symbol,
            "p": trade.price.inner().to_string(),
            "s": trade.size,
            "t": rfc3339(event.timestamp_ns),
        }),
        EventPayload::Quote(quote) => json!({
            "T": "q",
            "S": symbol,
            "bp": quote.bid.inner().to_string(),
            "bs": quote.bid_size,
            "ap": quote.ask.inner().to_string(),
            "as": quote.ask_size,
            "t": rfc3339(event.timestamp_ns),
        }),
        EventPayload::Bar(bar) => json!({
            "T": "b",
            "S": symbol,
            "o": bar.open.inner().to_string(),
            "h": bar.high.inner().to_string(),
            "l": bar.low.inner().to_string(),
            "c": bar.close.inner().to_string(),
            "v": bar.volume,
            "t": rfc3339(bar.start_ns),
        }),
        EventPayload::OrderUpdate(update) => {
            let (event_name, fill_fields) = match update.kind {
                OrderUpdateKind::Accepted => ("new", json!({})),
                OrderUpdateKind::Fill { qty, price, .. } => (
                    "fill",
                    json!({"qty": qty, "price": price.inner().to_string()}),
                ),
                OrderUpdateKind::Canceled => ("canceled", json!({})),
                OrderUpdateKind::Rejected => ("rejected", json!({})),
                OrderUpdateKind::Expired => ("expired", json!({})),
            };
            json!({
                "stream": "trade_updates",
                "data": {
                    "event": event_name,
                    "order": {
                        "id": update.order_id.to_string(),
                        "symbol": symbol,
                    },
                    "fill": fill_fields,
                },
            })
        }
        EventPayload::CorporateAction(action) => match action.kind {
            CorporateActionKind::Dividend { amount_per_share } => json!({
                "T": "corporate_action",
                "S": symbol,
                "kind": "dividend",
                "amount_per_share": amount_per_share.inner().to_string(),
            }),
            CorporateActionKind::Split { ratio } => json!({
                "T": "corporate_action",
                "S": symbol,
                "kind": "split",
                "ratio": ratio.0.to_string(),
            }),
        },
    };
    serde_json::to_vec(&value).unwrap_or_default()
}
