//! Finnhub-flavor envelopes: a single `{"type":..., "data":[...]}` wrapper
//! per symbol (Finnhub batches trades into one `data` array; here each
//! Event is emitted as its own single-element batch).

use crate::event::{CorporateActionKind, Event, EventPayload, OrderUpdateKind};
use serde_json::json;

pub fn format(event: &Event) -> Vec<u8> {
    let symbol = event.symbol.as_str();
    let value = match &event.payload {
        EventPayload::Trade(trade) => json!({
            "type": "trade",
            "data": [{
                "s": symbol,
                "p": trade.price.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "v": trade.size,
                "t": event.timestamp_ns / 1_000_000,
                "c": trade.conditions,
            }],
        }),
        EventPayload::Quote(quote) => json!({
            "type": "quote",
            "data": [{
                "s": symbol,
                "bp": quote.bid.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "bv": quote.bid_size,
                "ap": quote.ask.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "av": quote.ask_size,
                "t": event.timestamp_ns / 1_000_000,
            }],
        }),
        EventPayload::Bar(bar) => json!({
            "type": "bar",
            "data": [{
                "s": symbol,
                "o": bar.open.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "h": bar.high.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "l": bar.low.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "c": bar.close.inner().to_string().parse::<f64>().unwrap_or(0.0),
                "v": bar.volume,
                "t": bar.start_ns / 1_000_000,
            }],
        }),
        EventPayload::OrderUpdate(update) => {
            let status = match update.kind {
                OrderUpdateKind::Accepted => "accepted",
                OrderUpdateKind::Fill { .. } => "filled",
                OrderUpdateKind::Canceled => "canceled",
                OrderUpdateKind::Rejected => "rejected",
                OrderUpdateKind::Expired => "expired",
            };
            json!({
                "type": "order_update",
                "data": [{
                    "s": symbol,
                    "order_id": update.order_id.to_string(),
                    "status": status,
                }],
            })
        }
        EventPayload::CorporateAction(action) => match action.kind {
            CorporateActionKind::Dividend { amount_per_share } => json!({
                "type": "corporate_action",
                "data": [{
                    "s": symbol,
                    "kind": "dividend",
                    "amount_per_share": amount_per_share.inner().to_string().parse::<f64>().unwrap_or(0.0),
                }],
            }),
            CorporateActionKind::Split { ratio } => json!({
                "type": "corporate_action",
                "data": [{
                    "s": symbol,
                    "kind": "split",
                    "ratio": ratio.0.to_string().parse::<f64>().unwrap_or(0.0),
                }],
            }),
        },
    };
    serde_json::to_vec(&value).unwrap_or_default()
}
