//! Polygon-flavor envelopes: a channel-prefixed event array
//! (`T.`/`Q.`/`A.`/`AM.<symbol>`), values kept as raw numbers rather than
//! the Alpaca flavor's price strings.

use crate::event::{CorporateActionKind, Event, EventPayload, OrderUpdateKind};
use serde_json::json;

pub fn format(event: &Event) -> Vec<u8> {
    let symbol = event.symbol.as_str();
    let value = match &event.payload {
        EventPayload::Trade(trade) => json!([{
            "ev": "T",
            "sym": symbol,
            "p": trade.price.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "s": trade.size,
            "t": event.timestamp_ns / 1_000_000,
        }]),
        EventPayload::Quote(quote) => json!([{
            "ev": "Q",
            "sym": symbol,
            "bp": quote.bid.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "bs": quote.bid_size,
            "ap": quote.ask.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "as": quote.ask_size,
            "t": event.timestamp_ns / 1_000_000,
        }]),
        EventPayload::Bar(bar) => json!([{
            "ev": "AM",
            "sym": symbol,
            "o": bar.open.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "h": bar.high.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "l": bar.low.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "c": bar.close.inner().to_string().parse::<f64>().unwrap_or(0.0),
            "v": bar.volume,
            "s": bar.start_ns / 1_000_000,
            "e": bar.end_ns / 1_000_000,
        }]),
        EventPayload::OrderUpdate(update) => {
            let status = match update.kind {
                OrderUpdateKind::Accepted => "accepted",
                OrderUpdateKind::Fill { .. } => "filled",
                OrderUpdateKind::Canceled => "canceled",
                OrderUpdateKind::Rejected => "rejected",
                OrderUpdateKind::Expired => "expired",
            };
            json!([{
                "ev": "order_update",
                "sym": symbol,
                "order_id": update.order_id.to_string(),
                "status": status,
            }])
        }
        EventPayload::CorporateAction(action) => match action.kind {
            CorporateActionKind::Dividend { amount_per_share } => json!([{
                "ev": "corporate_action",
                "sym": symbol,
                "kind": "dividend",
                "amount_per_share": amount_per_share.inner().to_string().parse::<f64>().unwrap_or(0.0),
            }]),
            CorporateActionKind::Split { ratio } => json!([{
                "ev": "corporate_action",
                "sym": symbol,
                "kind": "split",
                "ratio": ratio.0.to_string().parse::<f64>().unwrap_or(0.0),
            }]),
        },
    };
    serde_json::to_vec(&value).unwrap_or_default()
}
