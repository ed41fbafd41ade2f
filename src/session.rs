//! Session (C8): composes the EventQueue, DataSource, TimeEngine,
//! MatchingEngine, Ledger and WAL under a single virtual clock, exposed as a
//! state machine driven by a dedicated loop task.
//!
//! The command mailbox (`mpsc` + per-call `oneshot` ack) is the teacher's
//! request/response channel idiom generalized from `websocket::service`'s
//! fire-and-forget `PushEvent` stream to calls that need a reply (submit,
//! cancel, lifecycle transitions). The loop body itself follows
//! `WsService::run`'s tick/drain-batch shape, replacing the fixed interval
//! with the TimeEngine's per-event pacing gate.

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::SessionConfig;
use crate::core_types::{Lsn, Nanos, OrderId, Seq, SessionId, Side, Symbol};
use crate::data_source::DataSource;
use crate::errors::{SimError, SimResult};
use crate::event::{CorporateActionKind, Event, EventPayload, OrderUpdateData, OrderUpdateKind};
use crate::event_queue::EventQueue;
use crate::ledger::{Ledger, LedgerError};
use crate::matching_engine::{Fill, MatchingEngine, SubmitRequest};
use crate::money::{Fee, Price};
use crate::orderbook::{Order, OrderKind, OrderStatus, RejectReason, TimeInForce};
use crate::wal::{CommandRecord, FillRecord, StateTransitionRecord, WalCommand, WalWriter};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{mpsc, oneshot, watch, RwLock as AsyncRwLock};

use crate::time_engine::{ControlSignal, TimeEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl SessionStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Error
        )
    }
}

/// Requests carried by the command mailbox. Every variant but the pure
/// lifecycle ones is acknowledged via its embedded `oneshot` sender, so API
/// request threads "block only on command acknowledgement" (spec §5).
pub enum SessionCommand {
    Submit(SubmitRequest, oneshot::Sender<SimResult<Order>>),
    Cancel(OrderId, oneshot::Sender<SimResult<Order>>),
    ApplyDividend(Symbol, Price, oneshot::Sender<SimResult<()>>),
    ApplySplit(Symbol, Decimal, oneshot::Sender<SimResult<()>>),
    Start(oneshot::Sender<SimResult<()>>),
    Pause(oneshot::Sender<SimResult<()>>),
    Resume(oneshot::Sender<SimResult<()>>),
    Stop(oneshot::Sender<SimResult<()>>),
    SetSpeed(f64, oneshot::Sender<SimResult<()>>),
    Jump(Nanos, oneshot::Sender<SimResult<()>>),
    FastForward(Nanos, oneshot::Sender<SimResult<()>>),
}

fn ack<T>(sender: oneshot::Sender<SimResult<T>>, result: SimResult<T>) {
    let _ = sender.send(result);
}

fn now_wall_ns() -> Nanos {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn map_ledger_error(err: LedgerError) -> RejectReason {
    match err {
        LedgerError::InsufficientBuyingPower => RejectReason::InsufficientBuyingPower,
        LedgerError::ForbiddenShort => RejectReason::ForbiddenShort,
        LedgerError::PositionCapExceeded => RejectReason::PositionCap,
        LedgerError::SingleOrderCapExceeded => RejectReason::SingleOrderCap,
    }
}

/// Shared handle to a running session: cheap to clone, safe to hand to many
/// API request tasks concurrently (spec §5 "client-facing request threads
/// never execute matching").
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    config: Arc<SessionConfig>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    status: Arc<StdRwLock<SessionStatus>>,
    clock_ns: Arc<AtomicI64>,
    events_processed: Arc<AtomicU64>,
    ledger: Arc<AsyncRwLock<Ledger>>,
    engine: Arc<AsyncRwLock<MatchingEngine>>,
}

impl SessionHandle {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().expect("session status lock poisoned")
    }

    /// `current_ns` of the session's virtual clock (spec §4.8 `get_watermark`).
    pub fn watermark(&self) -> Nanos {
        self.clock_ns.load(Ordering::Acquire)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub async fn account(&self) -> crate::ledger::Account {
        *self.ledger.read().await.account()
    }

    pub async fn positions(&self) -> Vec<(Symbol, crate::ledger::Position)> {
        self.ledger
            .read()
            .await
            .positions()
            .map(|(s, p)| (s.clone(), *p))
            .collect()
    }

    pub async fn orders(&self, status: Option<OrderStatus>) -> Vec<Order> {
        self.engine
            .read()
            .await
            .orders()
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect()
    }

    pub async fn order(&self, symbol: &Symbol, order_id: OrderId) -> Option<Order> {
        self.engine.read().await.order(symbol, order_id).cloned()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SimResult<T>>) -> SessionCommand,
    ) -> SimResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .map_err(|_| SimError::Unavailable("session loop has stopped".into()))?;
        rx.await
            .map_err(|_| SimError::Unavailable("session loop dropped the request".into()))?
    }

    pub async fn submit(&self, req: SubmitRequest) -> SimResult<Order> {
        self.call(|tx| SessionCommand::Submit(req, tx)).await
    }

    pub async fn cancel(&self, order_id: OrderId) -> SimResult<Order> {
        self.call(|tx| SessionCommand::Cancel(order_id, tx)).await
    }

    pub async fn apply_dividend(&self, symbol: Symbol, amount_per_share: Price) -> SimResult<()> {
        self.call(|tx| SessionCommand::ApplyDividend(symbol, amount_per_share, tx))
            .await
    }

    pub async fn apply_split(&self, symbol: Symbol, ratio: Decimal) -> SimResult<()> {
        self.call(|tx| SessionCommand::ApplySplit(symbol, ratio, tx))
            .await
    }

    pub async fn start(&self) -> SimResult<()> {
        self.call(SessionCommand::Start).await
    }

    pub async fn pause(&self) -> SimResult<()> {
        self.call(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> SimResult<()> {
        self.call(SessionCommand::Resume).await
    }

    pub async fn stop(&self) -> SimResult<()> {
        self.call(SessionCommand::Stop).await
    }

    pub async fn set_speed(&self, factor: f64) -> SimResult<()> {
        self.call(|tx| SessionCommand::SetSpeed(factor, tx)).await
    }

    pub async fn jump(&self, target_ns: Nanos) -> SimResult<()> {
        self.call(|tx| SessionCommand::Jump(target_ns, tx)).await
    }

    pub async fn fast_forward(&self, target_ns: Nanos) -> SimResult<()> {
        self.call(|tx| SessionCommand::FastForward(target_ns, tx))
            .await
    }
}

/// Owns every moving part a Created session needs; consumed by `spawn`.
struct SessionLoop {
    id: SessionId,
    config: SessionConfig,
    queue: EventQueue,
    source: Box<dyn DataSource>,
    time_engine: TimeEngine,
    control_tx: watch::Sender<ControlSignal>,
    ledger: Arc<AsyncRwLock<Ledger>>,
    engine: Arc<AsyncRwLock<MatchingEngine>>,
    wal_writer: Option<WalWriter<BufWriter<std::fs::File>>>,
    checkpointer: Option<Checkpointer>,
    last_lsn: Lsn,
    events_since_checkpoint: u64,
    cursor: (Nanos, Seq),
    last_price: FxHashMap<Symbol, Price>,
    next_seq: Seq,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    status: Arc<StdRwLock<SessionStatus>>,
    clock_ns: Arc<AtomicI64>,
    events_processed: Arc<AtomicU64>,
    fanout_tx: mpsc::UnboundedSender<(SessionId, Event)>,
}

enum Flow {
    Continue,
    Stop,
}

/// Spawns the dedicated session-loop task and returns a handle to it (spec
/// §4.7/§5: "one additional... worker per session owns WAL flushes", here
/// folded into the same loop task since flushing is bounded and synchronous).
pub fn spawn(
    id: SessionId,
    config: SessionConfig,
    source: Box<dyn DataSource>,
    wal_root: PathBuf,
    fanout_tx: mpsc::UnboundedSender<(SessionId, Event)>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = watch::channel(ControlSignal::Pause);
    let start_ns = config
        .start
        .timestamp_nanos_opt()
        .unwrap_or_else(|| config.start.timestamp() * 1_000_000_000);

    let ledger = Arc::new(AsyncRwLock::new(Ledger::new(
        config.initial_capital,
        config.maintenance_margin_pct,
        config.allow_shorting,
        config.max_position_value,
        config.max_single_order_value,
    )));
    let engine = Arc::new(AsyncRwLock::new(MatchingEngine::new(&config)));
    let status = Arc::new(StdRwLock::new(SessionStatus::Created));
    let clock_ns = Arc::new(AtomicI64::new(start_ns));
    let events_processed = Arc::new(AtomicU64::new(0));

    let session_wal_dir = config
        .wal_directory
        .clone()
        .unwrap_or_else(|| wal_root.join(id.to_string()));

    let (wal_writer, checkpointer, last_lsn) = if config.enable_wal {
        let _ = std::fs::create_dir_all(&session_wal_dir);
        let checkpointer = Checkpointer::new(session_wal_dir.join("checkpoints"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(session_wal_dir.join("wal.log"))
            .expect("opening WAL file");
        let last_lsn = checkpointer
            .load_latest()
            .ok()
            .flatten()
            .map(|c| c.metadata.last_lsn)
            .unwrap_or(0);
        (
            Some(WalWriter::new(BufWriter::new(file), last_lsn + 1)),
            Some(checkpointer),
            last_lsn,
        )
    } else {
        (None, None, 0)
    };

    let mut session_loop = SessionLoop {
        id,
        time_engine: TimeEngine::new(start_ns, config.speed_factor, control_rx),
        control_tx,
        queue: EventQueue::new(config.event_queue_capacity, config.event_queue_overflow_policy),
        source,
        ledger: ledger.clone(),
        engine: engine.clone(),
        wal_writer,
        checkpointer,
        last_lsn,
        events_since_checkpoint: 0,
        cursor: (start_ns, 0),
        last_price: FxHashMap::default(),
        next_seq: 1,
        command_rx,
        status: status.clone(),
        clock_ns: clock_ns.clone(),
        events_processed: events_processed.clone(),
        fanout_tx,
        config: config.clone(),
    };

    tokio::spawn(async move {
        session_loop.recover().await;
        session_loop.run().await;
    });

    SessionHandle {
        id,
        config: Arc::new(config),
        command_tx,
        status,
        clock_ns,
        events_processed,
        ledger,
        engine,
    }
}

impl SessionLoop {
    fn set_status(&self, status: SessionStatus) {
        *self.status.write().expect("session status lock poisoned") = status;
    }

    fn next_seq(&mut self) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn publish(&self, event: Event) {
        let _ = self.fanout_tx.send((self.id, event));
    }

    /// Restores `{ledger, source cursor, last_lsn}` from the latest
    /// checkpoint, then replays WAL records beyond it (spec §4.6 recovery).
    async fn recover(&mut self) {
        let Some(checkpointer) = self.checkpointer.as_ref() else {
            return;
        };
        let Ok(Some(Checkpoint { metadata, ledger })) = checkpointer.load_latest() else {
            return;
        };

        {
            let mut guard = self.ledger.write().await;
            *guard = Ledger::restore(
                ledger,
                self.config.maintenance_margin_pct,
                self.config.allow_shorting,
                self.config.max_position_value,
                self.config.max_single_order_value,
            );
        }
        let _ = self.source.seek((metadata.cursor_ns, metadata.cursor_seq));
        self.cursor = (metadata.cursor_ns, metadata.cursor_seq);
        self.last_lsn = metadata.last_lsn;

        let session_wal_dir = self
            .config
            .wal_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(".").join(self.id.to_string()));
        if let Ok(file) = std::fs::File::open(session_wal_dir.join("wal.log")) {
            let mut reader = crate::wal::WalReader::new(std::io::BufReader::new(file));
            if let Ok(entries) = reader.replay_after(metadata.last_lsn) {
                let mut engine = self.engine.write().await;
                let mut ledger = self.ledger.write().await;
                for entry in entries {
                    match entry.entry_type() {
                        Ok(crate::wal::WalEntryType::Command) => {
                            if let Ok(record) = entry.decode_command() {
                                replay_command(&mut engine, record);
                            }
                        }
                        Ok(crate::wal::WalEntryType::Fill) => {
                            if let Ok(record) = entry.decode_fill() {
                                ledger.apply_fill(
                                    &record.symbol,
                                    record.side,
                                    record.qty,
                                    record.price,
                                    record.fee,
                                );
                            }
                        }
                        _ => {}
                    }
                    self.last_lsn = self.last_lsn.max(entry.header.lsn);
                }
            }
        }
        tracing::info!(session_id = %self.id, last_lsn = self.last_lsn, "session recovered from checkpoint + WAL");
    }

    async fn run(mut self) {
        if !self.await_start().await {
            return;
        }

        loop {
            // Cedes the executor once per tick so a command sent right after
            // `start()`/`resume()` returns is guaranteed to reach the mailbox
            // before this loop races ahead and consumes the next event.
            tokio::task::yield_now().await;

            if self.drain_commands().await.is_err() {
                return;
            }

            let status = self.status();
            if status == SessionStatus::Paused {
                match self.command_rx.recv().await {
                    Some(cmd) => {
                        if let Flow::Stop = self.handle_command(cmd).await {
                            self.finalize(SessionStatus::Stopped).await;
                            return;
                        }
                    }
                    None => {
                        self.finalize(SessionStatus::Stopped).await;
                        return;
                    }
                }
                continue;
            }

            let Some(event) = self.next_event().await else {
                continue;
            };
            let Some(event) = event else {
                return; // session completed or errored inside next_event
            };

            match self.time_engine.release(event.timestamp_ns).await {
                Ok(()) => {}
                Err(()) => {
                    self.finalize(SessionStatus::Stopped).await;
                    return;
                }
            }
            self.clock_ns.store(event.timestamp_ns, Ordering::Release);
            self.cursor = event.key();

            self.process_event(event).await;
            self.events_processed.fetch_add(1, Ordering::Relaxed);
            self.maybe_checkpoint().await;
        }
    }

    fn status(&self) -> SessionStatus {
        *self.status.read().expect("session status lock poisoned")
    }

    async fn await_start(&mut self) -> bool {
        loop {
            match self.command_rx.recv().await {
                Some(SessionCommand::Start(tx)) => {
                    self.set_status(SessionStatus::Running);
                    let _ = self.control_tx.send(ControlSignal::Run);
                    ack(tx, Ok(()));
                    return true;
                }
                Some(SessionCommand::Stop(tx)) => {
                    self.set_status(SessionStatus::Stopped);
                    ack(tx, Ok(()));
                    return false;
                }
                Some(other) => {
                    self.reject_not_running(other);
                }
                None => return false,
            }
        }
    }

    fn reject_not_running(&self, cmd: SessionCommand) {
        let err = || SimError::PreconditionFailed("session is not running".into());
        match cmd {
            SessionCommand::Submit(_, tx) => ack(tx, Err(err())),
            SessionCommand::Cancel(_, tx) => ack(tx, Err(err())),
            SessionCommand::ApplyDividend(_, _, tx) => ack(tx, Err(err())),
            SessionCommand::ApplySplit(_, _, tx) => ack(tx, Err(err())),
            SessionCommand::Start(tx) => ack(tx, Err(err())),
            SessionCommand::Pause(tx) => ack(tx, Err(err())),
            SessionCommand::Resume(tx) => ack(tx, Err(err())),
            SessionCommand::Stop(tx) => ack(tx, Ok(())),
            SessionCommand::SetSpeed(_, tx) => ack(tx, Err(err())),
            SessionCommand::Jump(_, tx) => ack(tx, Err(err())),
            SessionCommand::FastForward(_, tx) => ack(tx, Err(err())),
        }
    }

    /// Drains every immediately-available command without blocking, so the
    /// loop never starves the mailbox waiting on the next market event.
    async fn drain_commands(&mut self) -> Result<(), ()> {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => {
                    if let Flow::Stop = self.handle_command(cmd).await {
                        self.finalize(SessionStatus::Stopped).await;
                        return Err(());
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.finalize(SessionStatus::Stopped).await;
                    return Err(());
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Submit(req, tx) => {
                let order = self.handle_submit(req).await;
                ack(tx, Ok(order));
                Flow::Continue
            }
            SessionCommand::Cancel(order_id, tx) => {
                let result = self.handle_cancel(order_id).await;
                ack(tx, result);
                Flow::Continue
            }
            SessionCommand::ApplyDividend(symbol, amount, tx) => {
                self.ledger.write().await.apply_dividend(&symbol, amount);
                self.journal_corporate_action(WalCommand::CorporateActionDividend {
                    symbol,
                    amount_per_share: amount,
                });
                ack(tx, Ok(()));
                Flow::Continue
            }
            SessionCommand::ApplySplit(symbol, ratio, tx) => {
                self.ledger.write().await.apply_split(&symbol, ratio);
                self.engine.write().await.apply_split(&symbol, ratio);
                self.journal_corporate_action(WalCommand::CorporateActionSplit { symbol, ratio });
                ack(tx, Ok(()));
                Flow::Continue
            }
            SessionCommand::Start(tx) => {
                ack(
                    tx,
                    Err(SimError::PreconditionFailed("session already started".into())),
                );
                Flow::Continue
            }
            SessionCommand::Pause(tx) => {
                if self.status() == SessionStatus::Running {
                    self.set_status(SessionStatus::Paused);
                    let _ = self.control_tx.send(ControlSignal::Pause);
                    ack(tx, Ok(()));
                } else {
                    ack(
                        tx,
                        Err(SimError::PreconditionFailed("session is not running".into())),
                    );
                }
                Flow::Continue
            }
            SessionCommand::Resume(tx) => {
                if self.status() == SessionStatus::Paused {
                    self.set_status(SessionStatus::Running);
                    let _ = self.control_tx.send(ControlSignal::Run);
                    ack(tx, Ok(()));
                } else {
                    ack(
                        tx,
                        Err(SimError::PreconditionFailed("session is not paused".into())),
                    );
                }
                Flow::Continue
            }
            SessionCommand::Stop(tx) => {
                let _ = self.control_tx.send(ControlSignal::Stop);
                ack(tx, Ok(()));
                Flow::Stop
            }
            SessionCommand::SetSpeed(factor, tx) => {
                if factor < 0.0 {
                    ack(tx, Err(SimError::InvalidArgument("speed must be >= 0".into())));
                } else {
                    self.time_engine.set_speed(factor);
                    ack(tx, Ok(()));
                }
                Flow::Continue
            }
            SessionCommand::Jump(target_ns, tx) => {
                if self.status() != SessionStatus::Paused {
                    ack(
                        tx,
                        Err(SimError::PreconditionFailed("jump is only legal while paused".into())),
                    );
                } else {
                    self.time_engine.jump(target_ns);
                    self.queue = EventQueue::new(
                        self.config.event_queue_capacity,
                        self.config.event_queue_overflow_policy,
                    );
                    let _ = self.source.seek((target_ns, 0));
                    self.clock_ns.store(target_ns, Ordering::Release);
                    ack(tx, Ok(()));
                }
                Flow::Continue
            }
            SessionCommand::FastForward(target_ns, tx) => {
                if self.status() != SessionStatus::Paused {
                    ack(
                        tx,
                        Err(SimError::PreconditionFailed(
                            "fast_forward is only legal while paused".into(),
                        )),
                    );
                } else {
                    let prior_speed = self.fast_forward_to(target_ns).await;
                    self.time_engine.set_speed(prior_speed);
                    ack(tx, Ok(()));
                }
                Flow::Continue
            }
        }
    }

    /// Drains events at speed zero up to `target_ns`, then restores the
    /// configured pacing (spec §4.3 `fast_forward`).
    async fn fast_forward_to(&mut self, target_ns: Nanos) -> f64 {
        let prior_speed = self.config.speed_factor;
        self.time_engine.set_speed(0.0);
        loop {
            let event = match self.queue.pop() {
                Some(e) => e,
                None => {
                    if self.source.is_exhausted() {
                        break;
                    }
                    match self.source.next_batch(256) {
                        Ok(batch) if batch.is_empty() => break,
                        Ok(batch) => {
                            for e in batch {
                                self.queue.push(e);
                            }
                            continue;
                        }
                        Err(_) => break,
                    }
                }
            };
            if event.timestamp_ns > target_ns {
                self.queue.push(event);
                break;
            }
            if self.time_engine.release(event.timestamp_ns).await.is_err() {
                break;
            }
            self.clock_ns.store(event.timestamp_ns, Ordering::Release);
            self.cursor = event.key();
            self.process_event(event).await;
            self.events_processed.fetch_add(1, Ordering::Relaxed);
        }
        prior_speed
    }

    /// Pulls the next event, refilling from the DataSource when the queue is
    /// empty. `Ok(None)` means "try again" (e.g. an empty prefetch batch);
    /// `Ok(Some(None))`... kept simple by nesting Option<Option<Event>>.
    async fn next_event(&mut self) -> Option<Option<Event>> {
        if let Some(event) = self.queue.pop() {
            return Some(Some(event));
        }
        if self.source.is_exhausted() {
            self.finalize(SessionStatus::Completed).await;
            return Some(None);
        }
        match self.source.next_batch(256) {
            Ok(batch) => {
                for event in batch {
                    self.queue.push(event);
                }
                None
            }
            Err(err) => {
                self.record_error(&err).await;
                self.finalize(SessionStatus::Error).await;
                Some(None)
            }
        }
    }

    async fn handle_submit(&mut self, req: SubmitRequest) -> Order {
        if req.qty == 0 {
            // Rejected purely on shape; still worth a seq/admission_ns so
            // the client sees a consistent Order record.
        }
        let seq = self.next_seq();
        let now_ns = self.time_engine.current_ns();
        let est_price = req
            .limit_price
            .or(req.stop_price)
            .or_else(|| self.last_price.get(&req.symbol).copied())
            .unwrap_or_else(Price::zero);

        let admission = self
            .ledger
            .read()
            .await
            .check_admission(&req.symbol, req.side, req.qty, est_price);

        let symbol = req.symbol.clone();
        let wal_command = WalCommand::Submit {
            order_id: req.id,
            client_id: req.client_id.clone(),
            symbol: symbol.clone(),
            side: req.side,
            kind: req.kind,
            tif: req.tif,
            qty: req.qty,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            trail_price: req.trail_price,
            trail_percent: req.trail_percent,
        };

        let mut order = {
            let mut engine = self.engine.write().await;
            engine.admit(req, now_ns, seq)
        };

        if let Err(err) = admission {
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some(map_ledger_error(err));
            self.engine.write().await.cancel(&symbol, order.id);
        }

        self.journal_command(wal_command);

        let kind = match order.status {
            OrderStatus::Rejected => OrderUpdateKind::Rejected,
            _ => OrderUpdateKind::Accepted,
        };
        self.publish(Event {
            timestamp_ns: now_ns,
            symbol,
            seq: self.next_seq(),
            payload: EventPayload::OrderUpdate(OrderUpdateData {
                order_id: order.id,
                kind,
            }),
        })
        .await;

        order
    }

    async fn handle_cancel(&mut self, order_id: OrderId) -> SimResult<Order> {
        let symbol = {
            let engine = self.engine.read().await;
            engine
                .orders()
                .find(|o| o.id == order_id)
                .map(|o| o.symbol.clone())
        };
        let Some(symbol) = symbol else {
            return Err(SimError::NotFound(format!("order {order_id} not found")));
        };
        let mut removed = self
            .engine
            .write()
            .await
            .cancel(&symbol, order_id)
            .ok_or_else(|| SimError::NotFound(format!("order {order_id} not found")))?;
        removed.status = OrderStatus::Canceled;
        self.journal_command(WalCommand::Cancel { order_id });
        self.publish(Event {
            timestamp_ns: self.time_engine.current_ns(),
            symbol,
            seq: self.next_seq(),
            payload: EventPayload::OrderUpdate(OrderUpdateData {
                order_id,
                kind: OrderUpdateKind::Canceled,
            }),
        })
        .await;
        Ok(removed)
    }

    async fn process_event(&mut self, event: Event) {
        let symbol = event.symbol.clone();
        match &event.payload {
            EventPayload::Trade(trade) => {
                self.last_price.insert(symbol.clone(), trade.price);
                let now_ns = self.time_engine.current_ns();
                let fills = {
                    let mut engine = self.engine.write().await;
                    engine.on_trade(&symbol, trade.price, trade.size, now_ns)
                };
                self.apply_fills(&symbol, fills).await;
                self.mark_and_check_margin(&symbol, trade.price).await;
            }
            EventPayload::Quote(quote) => {
                let mid = Price::new((quote.bid.inner() + quote.ask.inner()) / Decimal::from(2));
                self.last_price.insert(symbol.clone(), mid);
                self.mark_and_check_margin(&symbol, mid).await;
            }
            EventPayload::Bar(bar) => {
                self.last_price.insert(symbol.clone(), bar.close);
                self.mark_and_check_margin(&symbol, bar.close).await;
            }
            EventPayload::OrderUpdate(_) => {}
            EventPayload::CorporateAction(action) => match action.kind {
                CorporateActionKind::Dividend { amount_per_share } => {
                    self.ledger
                        .write()
                        .await
                        .apply_dividend(&symbol, amount_per_share);
                }
                CorporateActionKind::Split { ratio } => {
                    self.ledger.write().await.apply_split(&symbol, ratio.0);
                    self.engine.write().await.apply_split(&symbol, ratio.0);
                }
            },
        }
        self.publish(event).await;
    }

    async fn mark_and_check_margin(&mut self, symbol: &Symbol, price: Price) {
        self.ledger.write().await.mark_to_market(symbol, price);
        if !self.config.enable_margin_call_checks {
            return;
        }
        let margin_call = self.ledger.read().await.check_margin();
        if margin_call.is_none() {
            return;
        }
        tracing::warn!(session_id = %self.id, symbol = %symbol, "margin call detected");
        if !self.config.enable_forced_liquidation {
            return;
        }
        self.force_liquidate().await;
    }

    /// Synthesizes market orders closing positions in descending risk order
    /// until equity clears `1.5 * maintenance_margin` (spec §4.5).
    async fn force_liquidate(&mut self) {
        loop {
            let target = self.ledger.read().await.forced_liquidation_target();
            let equity = self.ledger.read().await.account().equity();
            if equity >= target {
                return;
            }
            let symbols = self.ledger.read().await.positions_by_descending_risk();
            let Some(symbol) = symbols.into_iter().next() else {
                return;
            };
            let qty = self
                .ledger
                .read()
                .await
                .position(&symbol)
                .map(|p| p.qty())
                .unwrap_or(0);
            if qty == 0 {
                return;
            }
            let side = if qty > 0 { Side::Sell } else { Side::Buy };
            let req = SubmitRequest {
                id: uuid::Uuid::new_v4(),
                client_id: None,
                symbol: symbol.clone(),
                side,
                kind: OrderKind::Market,
                tif: TimeInForce::Ioc,
                qty: qty.unsigned_abs(),
                limit_price: None,
                stop_price: None,
                trail_price: None,
                trail_percent: None,
            };
            self.handle_submit(req).await;

            let Some(price) = self.last_price.get(&symbol).copied() else {
                return;
            };
            let fills = {
                let mut engine = self.engine.write().await;
                let trade_size = qty.unsigned_abs() as u32;
                engine.on_trade(&symbol, price, trade_size, self.time_engine.current_ns())
            };
            if fills.is_empty() {
                return; // no liquidity to close against; avoid an infinite loop
            }
            self.apply_fills(&symbol, fills).await;
        }
    }

    async fn apply_fills(&mut self, symbol: &Symbol, fills: Vec<Fill>) {
        for fill in fills {
            self.ledger
                .write()
                .await
                .apply_fill(symbol, fill.side, fill.qty, fill.price, fill.fee);

            let lsn = self.journal_fill(symbol, &fill);

            let update = Event {
                timestamp_ns: self.time_engine.current_ns(),
                symbol: symbol.clone(),
                seq: self.next_seq(),
                payload: EventPayload::OrderUpdate(OrderUpdateData {
                    order_id: fill.order_id,
                    kind: OrderUpdateKind::Fill {
                        qty: fill.qty,
                        price: fill.price,
                        fee: fill.fee,
                        is_maker: fill.is_maker,
                    },
                }),
            };
            if lsn.is_err() {
                self.record_error(&SimError::Internal("WAL append failed".into()))
                    .await;
                self.finalize(SessionStatus::Error).await;
                return;
            }
            self.publish(update).await;
        }
    }

    fn journal_command(&mut self, command: WalCommand) {
        let Some(writer) = self.wal_writer.as_mut() else {
            return;
        };
        let record = CommandRecord {
            session_id: self.id,
            wall_ns: now_wall_ns(),
            sim_ns: self.time_engine.current_ns(),
            command,
        };
        if let Ok(lsn) = writer.append_command(&record) {
            self.last_lsn = lsn;
            let _ = writer.flush();
        }
    }

    fn journal_corporate_action(&mut self, command: WalCommand) {
        self.journal_command(command);
    }

    /// Appends + flushes a Fill record before the fill is otherwise
    /// observable (spec §4.6 "post-fill" durability point).
    fn journal_fill(&mut self, symbol: &Symbol, fill: &Fill) -> std::io::Result<()> {
        let Some(writer) = self.wal_writer.as_mut() else {
            return Ok(());
        };
        let record = FillRecord {
            session_id: self.id,
            wall_ns: now_wall_ns(),
            sim_ns: self.time_engine.current_ns(),
            order_id: fill.order_id,
            symbol: symbol.clone(),
            side: fill.side,
            qty: fill.qty,
            price: fill.price,
            fee: fill.fee,
            is_maker: fill.is_maker,
        };
        let lsn = writer.append_fill(&record)?;
        self.last_lsn = lsn;
        writer.flush()
    }

    async fn maybe_checkpoint(&mut self) {
        let Some(checkpointer) = self.checkpointer.as_ref() else {
            return;
        };
        self.events_since_checkpoint += 1;
        if self.events_since_checkpoint < self.config.checkpoint_interval_events {
            return;
        }
        self.events_since_checkpoint = 0;
        let snapshot = self.ledger.read().await.snapshot();
        if let Err(e) = checkpointer.create(self.cursor, self.last_lsn, &snapshot) {
            tracing::error!(session_id = %self.id, error = %e, "checkpoint write failed");
        }
    }

    async fn record_error(&mut self, err: &SimError) {
        tracing::error!(session_id = %self.id, error = %err, "session fatal error");
        if let Some(writer) = self.wal_writer.as_mut() {
            let record = crate::wal::ErrorRecord {
                session_id: self.id,
                wall_ns: now_wall_ns(),
                sim_ns: self.time_engine.current_ns(),
                message: err.to_string(),
            };
            let _ = writer.append_error(&record);
            let _ = writer.flush();
        }
    }

    async fn finalize(&mut self, status: SessionStatus) {
        self.set_status(status);
        let _ = self.control_tx.send(ControlSignal::Stop);
        if let Some(writer) = self.wal_writer.as_mut() {
            let record = StateTransitionRecord {
                session_id: self.id,
                wall_ns: now_wall_ns(),
                sim_ns: self.time_engine.current_ns(),
                from_status: "Running".to_string(),
                to_status: format!("{status:?}"),
            };
            let _ = writer.append_state_transition(&record);
            let _ = writer.flush();
        }
        tracing::info!(session_id = %self.id, status = ?status, "session loop exiting");
    }
}

/// Re-applies a journaled command against a freshly-restored engine during
/// recovery, reconstructing resting-order state without re-running the
/// admission cost model (the fills themselves are replayed separately from
/// `FillRecord`s).
fn replay_command(engine: &mut MatchingEngine, record: CommandRecord) {
    match record.command {
        WalCommand::Submit {
            order_id,
            client_id,
            symbol,
            side,
            kind,
            tif,
            qty,
            limit_price,
            stop_price,
            trail_price,
            trail_percent,
        } => {
            let req = SubmitRequest {
                id: order_id,
                client_id,
                symbol,
                side,
                kind,
                tif,
                qty,
                limit_price,
                stop_price,
                trail_price,
                trail_percent,
            };
            engine.admit(req, record.sim_ns, 0);
        }
        WalCommand::Cancel { order_id } => {
            for symbol in engine
                .orders()
                .filter(|o| o.id == order_id)
                .map(|o| o.symbol.clone())
                .collect::<Vec<_>>()
            {
                engine.cancel(&symbol, order_id);
            }
        }
        WalCommand::CorporateActionSplit { symbol, ratio } => {
            engine.apply_split(&symbol, ratio);
        }
        WalCommand::Replace { .. } | WalCommand::CorporateActionDividend { .. } => {
            // Dividends and replaces touch the Ledger, not resting order
            // state, and are reconstructed from FillRecords/ledger
            // checkpoint instead.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeTable, OverflowPolicy, WsConfig};
    use crate::event::{QuoteData, TradeData};
    use std::collections::VecDeque;

    struct FixedDataSource {
        events: VecDeque<Event>,
    }

    impl DataSource for FixedDataSource {
        fn next_batch(&mut self, max: usize) -> SimResult<Vec<Event>> {
            let mut out = Vec::new();
            while out.len() < max {
                let Some(event) = self.events.pop_front() else {
                    break;
                };
                out.push(event);
            }
            Ok(out)
        }

        fn seek(&mut self, _cursor: (Nanos, Seq)) -> SimResult<()> {
            Ok(())
        }

        fn is_exhausted(&self) -> bool {
            self.events.is_empty()
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            symbols: vec!["AAPL".into()],
            start: chrono::Utc::now(),
            end: chrono::Utc::now(),
            initial_capital: Decimal::from(100_000),
            speed_factor: 0.0,
            enable_latency: false,
            enable_slippage: false,
            enable_market_impact: false,
            enable_partial_fills: false,
            enable_margin_call_checks: false,
            enable_forced_liquidation: false,
            enable_wal: false,
            fixed_latency_us: 0,
            random_latency_max_us: 0,
            fixed_slippage_bps: 0.0,
            random_slippage_max_bps: 0.0,
            market_impact_bps: 0.0,
            market_impact_per_share: 0.0,
            market_impact_sqrt_coef: 0.0,
            partial_fill_probability: 0.0,
            rejection_probability: 0.0,
            allow_shorting: true,
            max_position_value: None,
            max_single_order_value: None,
            maintenance_margin_pct: Decimal::new(25, 2),
            fee_table: FeeTable::default(),
            ws: WsConfig::default(),
            checkpoint_interval_events: 1_000_000,
            wal_directory: None,
            event_queue_capacity: 10_000,
            event_queue_overflow_policy: OverflowPolicy::DropOldest,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_at_next_trade() {
        let source = Box::new(FixedDataSource {
            events: VecDeque::from(vec![Event {
                timestamp_ns: 0,
                symbol: Symbol::new("AAPL"),
                seq: 1,
                payload: EventPayload::Trade(TradeData {
                    price: Price::new(Decimal::from(150)),
                    size: 1000,
                    conditions: vec![],
                    exchange: 1,
                    sip_ts_ns: 0,
                }),
            }]),
        });
        let (fanout_tx, mut fanout_rx) = mpsc::unbounded_channel();
        let handle = spawn(
            uuid::Uuid::new_v4(),
            test_config(),
            source,
            PathBuf::from("/tmp/broker-sim-session-test"),
            fanout_tx,
        );
        handle.start().await.unwrap();

        let order = handle
            .submit(SubmitRequest {
                id: uuid::Uuid::new_v4(),
                client_id: None,
                symbol: Symbol::new("AAPL"),
                side: Side::Buy,
                kind: OrderKind::Market,
                tif: TimeInForce::Day,
                qty: 100,
                limit_price: None,
                stop_price: None,
                trail_price: None,
                trail_percent: None,
            })
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);

        // Drain fanout until the loop completes (deterministic: one trade,
        // one fill, then Completed).
        let mut saw_fill = false;
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), fanout_rx.recv())
                .await
            {
                Ok(Some((_, Event { payload: EventPayload::OrderUpdate(update), .. }))) => {
                    if matches!(update.kind, OrderUpdateKind::Fill { .. }) {
                        saw_fill = true;
                        break;
                    }
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_fill, "expected a Fill OrderUpdate to be published");

        let account = handle.account().await;
        assert_eq!(account.cash(), Decimal::from(85_000));
    }

    #[tokio::test]
    async fn rejects_commands_before_start() {
        let source = Box::new(FixedDataSource {
            events: VecDeque::from(vec![Event {
                timestamp_ns: 0,
                symbol: Symbol::new("AAPL"),
                seq: 1,
                payload: EventPayload::Quote(QuoteData {
                    bid: Price::new(Decimal::from(99)),
                    bid_size: 10,
                    ask: Price::new(Decimal::from(101)),
                    ask_size: 10,
                }),
            }]),
        });
        let (fanout_tx, _fanout_rx) = mpsc::unbounded_channel();
        let handle = spawn(
            uuid::Uuid::new_v4(),
            test_config(),
            source,
            PathBuf::from("/tmp/broker-sim-session-test"),
            fanout_tx,
        );
        let result = handle.pause().await;
        assert!(result.is_err());
    }
}
