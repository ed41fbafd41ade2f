//! Outbound wire-format adapters (C11): translates the internal `Event`
//! enum into the JSON envelope each vendor-compatible stream flavor expects
//! (spec §6 "vendor-compatible APIs"). Grounded on the teacher's
//! `websocket::service::WsService::handle_event` per-message-kind dispatch,
//! generalized from one fixed wire format to one-per-`ApiFlavor`.

mod alpaca;
mod finnhub;
mod polygon;

use crate::core_types::{ApiFlavor, SessionId};
use crate::event::Event;
use serde::Serialize;

/// Formats `event` for `flavor`, returning the exact bytes to enqueue on a
/// subscriber's outbox. Falls back to a flavor-neutral envelope for
/// `Generic` subscribers (e.g. internal tooling, tests).
pub fn format_outbound(flavor: ApiFlavor, session_id: SessionId, event: &Event) -> Vec<u8> {
    match flavor {
        ApiFlavor::Alpaca => alpaca::format(event),
        ApiFlavor::Polygon => polygon::format(event),
        ApiFlavor::Finnhub => finnhub::format(event),
        ApiFlavor::Generic => format_generic(session_id, event),
    }
}

#[derive(Serialize)]
struct GenericEnvelope<'a> {
    session_id: SessionId,
    event: &'a Event,
}

fn format_generic(session_id: SessionId, event: &Event) -> Vec<u8> {
    serde_json::to_vec(&GenericEnvelope { session_id, event }).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Symbol;
    use crate::event::{EventPayload, TradeData};
    use crate::money::Price;
    use rust_decimal::Decimal;

    fn trade_event() -> Event {
        Event {
            timestamp_ns: 1_700_000_000_000_000_000,
            symbol: Symbol::new("AAPL"),
            seq: 7,
            payload: EventPayload::Trade(TradeData {
                price: Price::new(Decimal::from(150)),
                size: 10,
                conditions: vec![],
                exchange: 4,
                sip_ts_ns: 1_700_000_000_000_000_000,
            }),
        }
    }

    #[test]
    fn every_flavor_produces_nonempty_json() {
        let event = trade_event();
        let session_id = uuid::Uuid::new_v4();
        for flavor in [
            ApiFlavor::Alpaca,
            ApiFlavor::Polygon,
            ApiFlavor::Finnhub,
            ApiFlavor::Generic,
        ] {
            let bytes = format_outbound(flavor, session_id, &event);
            assert!(!bytes.is_empty());
            assert!(serde_json::from_slice::<serde_json::Value>(&bytes).is_ok());
        }
    }
}
