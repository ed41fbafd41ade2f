//! DataSource (C3): a lazy, time-ordered sequence of Events for a symbol
//! set over a time range.
//!
//! Grounded on the teacher's `csv_io.rs` load-from-flat-file discipline,
//! generalized from "parse once at startup" to a restartable streaming
//! cursor: each symbol gets its own line reader, and a min-heap k-way
//! merges them into non-decreasing `(timestamp_ns, seq)` order, the same
//! shape bar/trade/quote vendors ship historical data in.

use crate::core_types::{Nanos, Seq, Symbol};
use crate::errors::SimError;
use crate::event::{BarData, Event, EventPayload, QuoteData, TradeData};
use crate::money::Price;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use rust_decimal::Decimal;

/// Produces events lazily in `(timestamp_ns, seq)` order. Implementors may
/// prefetch in batches; backpressure to the EventQueue is the consumer's
/// polling rate (spec §4.2).
pub trait DataSource: Send {
    /// Pulls up to `max` further events. An empty, non-exhausted result is
    /// legal (e.g. between prefetch batches); callers should retry.
    fn next_batch(&mut self, max: usize) -> Result<Vec<Event>, SimError>;

    /// Re-seeks so that the next event returned has a key `>= cursor`.
    /// Used by `TimeEngine::jump` and WAL recovery.
    fn seek(&mut self, cursor: (Nanos, Seq)) -> Result<(), SimError>;

    fn is_exhausted(&self) -> bool;
}

/// One symbol's backing file: a line-oriented reader plus the next
/// already-parsed record, so the merge heap can peek without consuming.
struct SymbolCursor {
    symbol: Symbol,
    reader: BufReader<File>,
    pending: Option<Event>,
    exhausted: bool,
}

impl SymbolCursor {
    fn open(symbol: Symbol, path: &Path) -> Result<Self, SimError> {
        let file = File::open(path).map_err(|e| {
            SimError::Unavailable(format!("opening data source {}: {e}", path.display()))
        })?;
        let mut cursor = Self {
            symbol,
            reader: BufReader::new(file),
            pending: None,
            exhausted: false,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    /// Reads the next non-blank line into `pending`, skipping the header.
    fn advance(&mut self) -> Result<(), SimError> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| SimError::Unavailable(format!("reading data source: {e}")))?;
            if read == 0 {
                self.pending = None;
                self.exhausted = true;
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() || line.starts_with("timestamp_ns") {
                continue;
            }
            self.pending = Some(parse_row(&self.symbol, line)?);
            return Ok(());
        }
    }

    fn peek_key(&self) -> Option<(Nanos, Seq)> {
        self.pending.as_ref().map(Event::key)
    }
}

fn parse_row(symbol: &Symbol, line: &str) -> Result<Event, SimError> {
    let cols: Vec<&str> = line.split(',').collect();
    let bad = |msg: &str| SimError::Unavailable(format!("malformed data source row: {msg}"));
    if cols.len() < 3 {
        return Err(bad("too few columns"));
    }
    let timestamp_ns: Nanos = cols[0].parse().map_err(|_| bad("timestamp_ns"))?;
    let seq: Seq = cols[1].parse().map_err(|_| bad("seq"))?;
    let kind = cols[2];

    let payload = match kind {
        "trade" => {
            if cols.len() < 7 {
                return Err(bad("trade row"));
            }
            let price = Price::new(cols[3].parse::<Decimal>().map_err(|_| bad("price"))?);
            let size: u32 = cols[4].parse().map_err(|_| bad("size"))?;
            let exchange: u8 = cols[5].parse().map_err(|_| bad("exchange"))?;
            let conditions: Vec<u8> = if cols[6].is_empty() {
                Vec::new()
            } else {
                cols[6]
                    .split(';')
                    .map(|c| c.parse::<u8>().map_err(|_| bad("conditions")))
                    .collect::<Result<_, _>>()?
            };
            EventPayload::Trade(TradeData {
                price,
                size,
                conditions,
                exchange,
                sip_ts_ns: timestamp_ns,
            })
        }
        "quote" => {
            if cols.len() < 7 {
                return Err(bad("quote row"));
            }
            EventPayload::Quote(QuoteData {
                bid: Price::new(cols[3].parse::<Decimal>().map_err(|_| bad("bid"))?),
                bid_size: cols[4].parse().map_err(|_| bad("bid_size"))?,
                ask: Price::new(cols[5].parse::<Decimal>().map_err(|_| bad("ask"))?),
                ask_size: cols[6].parse().map_err(|_| bad("ask_size"))?,
            })
        }
        "bar" => {
            if cols.len() < 11 {
                return Err(bad("bar row"));
            }
            EventPayload::Bar(BarData {
                open: Price::new(cols[3].parse::<Decimal>().map_err(|_| bad("open"))?),
                high: Price::new(cols[4].parse::<Decimal>().map_err(|_| bad("high"))?),
                low: Price::new(cols[5].parse::<Decimal>().map_err(|_| bad("low"))?),
                close: Price::new(cols[6].parse::<Decimal>().map_err(|_| bad("close"))?),
                volume: cols[7].parse().map_err(|_| bad("volume"))?,
                vwap: Price::new(cols[8].parse::<Decimal>().map_err(|_| bad("vwap"))?),
                start_ns: timestamp_ns,
                end_ns: cols[9].parse().map_err(|_| bad("end_ns"))?,
                is_open: cols[10] == "1",
                is_close: cols.get(11).map(|c| *c == "1").unwrap_or(false),
            })
        }
        other => return Err(bad(&format!("unknown row kind {other}"))),
    };

    Ok(Event {
        timestamp_ns,
        symbol: symbol.clone(),
        seq,
        payload,
    })
}

/// A CSV-backed DataSource, one file per symbol under `root`, named
/// `<symbol>.csv`. Rows are `timestamp_ns,seq,kind,...` with kind-specific
/// trailing columns (spec is silent on wire format; this mirrors the
/// teacher's plain positional CSV).
pub struct CsvDataSource {
    root: PathBuf,
    t_start: Nanos,
    t_end: Nanos,
    cursors: Vec<SymbolCursor>,
}

impl CsvDataSource {
    pub fn open(
        root: impl Into<PathBuf>,
        symbols: &[Symbol],
        t_start: Nanos,
        t_end: Nanos,
    ) -> Result<Self, SimError> {
        let root = root.into();
        let mut cursors = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let path = root.join(format!("{}.csv", symbol.as_str()));
            cursors.push(SymbolCursor::open(symbol.clone(), &path)?);
        }
        let mut source = Self {
            root,
            t_start,
            t_end,
            cursors,
        };
        source.seek((t_start, 0))?;
        Ok(source)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DataSource for CsvDataSource {
    fn next_batch(&mut self, max: usize) -> Result<Vec<Event>, SimError> {
        let mut heap: BinaryHeap<Reverse<(Nanos, Seq, usize)>> = BinaryHeap::new();
        for (i, c) in self.cursors.iter().enumerate() {
            if let Some((ts, seq)) = c.peek_key() {
                heap.push(Reverse((ts, seq, i)));
            }
        }

        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            let Some(Reverse((ts, _seq, idx))) = heap.pop() else {
                break;
            };
            if ts > self.t_end {
                // Past the requested range: drain this cursor's remaining
                // relevance by marking exhausted without reading further.
                self.cursors[idx].pending = None;
                self.cursors[idx].exhausted = true;
                continue;
            }
            let event = self.cursors[idx].pending.take().expect("peeked key implies pending");
            self.cursors[idx].advance()?;
            if let Some((ts2, seq2)) = self.cursors[idx].peek_key() {
                heap.push(Reverse((ts2, seq2, idx)));
            }
            out.push(event);
        }
        Ok(out)
    }

    fn seek(&mut self, cursor: (Nanos, Seq)) -> Result<(), SimError> {
        for c in &mut self.cursors {
            while let Some(key) = c.peek_key() {
                if key >= cursor {
                    break;
                }
                c.advance()?;
            }
        }
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.cursors.iter().all(|c| c.exhausted)
            || self
                .cursors
                .iter()
                .all(|c| c.peek_key().map(|(ts, _)| ts > self.t_end).unwrap_or(true))
    }
}
