//! Drag session controller.
//!
//! Owns the local board, applies UI commands to it, and keeps the backend in
//! sync after every drop. Request/response backends go through a
//! [`SequentialRequest`] so a burst of drops only ever honours the newest one.

use crate::board;
use crate::model::{Board, DropTarget, SessionEvent};
use crate::sequential::{LatestRef, RequestError, SequentialRequest, SupersededPolicy};
use crate::transport::{BoardSocket, ClientEvent, RestClient, ServerEvent, TransportError};
use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    /// The dragged item is now hovering over `over`.
    DragMove { active: String, over: DropTarget },
    /// The drag finished; `dropped` is false when released outside any target.
    DragEnd { dropped: bool },
    AddContainer { title: String, description: String },
    AddItem { container_id: String, title: String },
    Quit,
}

type SendFn =
    dyn Fn(Board, CancellationToken) -> BoxFuture<'static, Result<String, TransportError>> + Send + Sync;

/// How the session pushes the board to the backend.
pub(crate) enum SyncBackend {
    /// Request/response: each drop triggers the runner with the latest board.
    Request {
        runner: SequentialRequest<String, TransportError>,
        send: Arc<SendFn>,
    },
    /// Fire-and-forget over a realtime channel; the board comes back as `DataUpdated`.
    Socket(BoardSocket),
}

impl SyncBackend {
    /// Wrap an arbitrary send function.
    pub(crate) fn request<F, Fut>(send: F, policy: SupersededPolicy) -> Self
    where
        F: Fn(Board, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, TransportError>> + Send + 'static,
    {
        let send: Arc<SendFn> = Arc::new(
            move |board: Board, token: CancellationToken| -> BoxFuture<'static, Result<String, TransportError>> {
                send(board, token).boxed()
            },
        );
        let initial = Arc::clone(&send);
        let factory = LatestRef::from_fn(move |token: CancellationToken| initial(Board::default(), token));
        SyncBackend::Request {
            runner: SequentialRequest::with_policy(factory, policy),
            send,
        }
    }

    pub(crate) fn rest(client: RestClient, policy: SupersededPolicy) -> Self {
        Self::request(
            move |board, token| {
                let client = client.clone();
                async move { client.update_items_order(&board, &token).await }
            },
            policy,
        )
    }

    /// Point the runner's factory at `board`, so the next trigger sends it.
    fn track(&self, board: &Board) {
        if let SyncBackend::Request { runner, send } = self {
            let send = Arc::clone(send);
            let board = board.clone();
            runner
                .factory()
                .replace(move |token: CancellationToken| send(board.clone(), token));
        }
    }
}

/// Counters collected over a session.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionStats {
    pub drags: usize,
    pub started: u64,
    pub completed: u64,
    pub superseded: u64,
    pub failed: u64,
    pub rtt_ms: Vec<f64>,
    pub last_response: Option<String>,
}

pub(crate) struct SessionOutcome {
    pub board: Board,
    pub stats: SessionStats,
}

/// A triggered request that has settled.
struct Settled {
    seq: u64,
    started: Instant,
    result: Result<String, RequestError<TransportError>>,
}

struct Session {
    board: Board,
    event_tx: UnboundedSender<SessionEvent>,
    stats: SessionStats,
    next_seq: u64,
    latest_seq: u64,
    in_flight: FuturesUnordered<BoxFuture<'static, Settled>>,
    // Emits awaiting their DataUpdated echo, oldest first.
    socket_pending: VecDeque<(u64, Instant)>,
}

impl Session {
    fn set_board(&mut self, next: Board) {
        if next != self.board {
            self.board = next;
            let _ = self.event_tx.send(SessionEvent::BoardChanged {
                board: self.board.clone(),
            });
        }
    }

    fn info(&self, msg: String) {
        let _ = self.event_tx.send(SessionEvent::Info(msg));
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.latest_seq = seq;
        self.stats.started += 1;
        let _ = self.event_tx.send(SessionEvent::SyncStarted { seq });
        seq
    }

    fn sync(&mut self, backend: &SyncBackend) -> Result<()> {
        match backend {
            SyncBackend::Request { runner, .. } => {
                backend.track(&self.board);
                let seq = self.next_seq();
                let started = Instant::now();
                let request = runner.trigger();
                self.in_flight.push(
                    async move {
                        Settled {
                            seq,
                            started,
                            result: request.await,
                        }
                    }
                    .boxed(),
                );
                tracing::debug!(seq, "sync triggered");
            }
            SyncBackend::Socket(socket) => {
                socket
                    .emit(ClientEvent::UpdatedItems {
                        seq: self.next_seq,
                        board: self.board.clone(),
                    })
                    .context("failed to emit board update")?;
                let seq = self.next_seq();
                self.socket_pending.push_back((seq, Instant::now()));
                tracing::debug!(seq, "board update emitted");
            }
        }
        Ok(())
    }

    fn settle(&mut self, settled: Settled) {
        let Settled {
            seq,
            started,
            result,
        } = settled;
        match result {
            Ok(response) if seq == self.latest_seq => {
                let rtt = started.elapsed();
                tracing::info!(seq, rtt_ms = rtt.as_millis() as u64, "sync completed");
                self.stats.completed += 1;
                self.stats.rtt_ms.push(rtt.as_secs_f64() * 1000.0);
                self.stats.last_response = Some(response.clone());
                let _ = self.event_tx.send(SessionEvent::SyncCompleted { seq, response, rtt });
            }
            // A stale operation that finished anyway; its result is discarded.
            Ok(_) => self.superseded(seq),
            Err(e) if e.is_cancelled() => self.superseded(seq),
            Err(e) => {
                tracing::warn!(seq, error = %e, "sync failed");
                self.stats.failed += 1;
                let _ = self.event_tx.send(SessionEvent::SyncFailed {
                    seq,
                    error: format!("{e}"),
                });
            }
        }
    }

    fn superseded(&mut self, seq: u64) {
        tracing::debug!(seq, "sync superseded");
        self.stats.superseded += 1;
        let _ = self.event_tx.send(SessionEvent::SyncSuperseded { seq });
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::InitialData(board) => {
                tracing::debug!(items = board.item_count(), "initial data received");
                self.set_board(board);
            }
            ServerEvent::DataUpdated { board, ack } => {
                match ack {
                    Some(ack) => self.acknowledge(ack),
                    None => tracing::debug!(items = board.item_count(), "remote board update"),
                }
                // Anything received while our own emits are pending was applied
                // before them on the server and will be overwritten by them.
                if self.socket_pending.is_empty() {
                    self.set_board(board);
                } else {
                    tracing::debug!(pending = self.socket_pending.len(), "board update ignored, own emits pending");
                }
            }
        }
    }

    /// Settle the pending emit echoed back as `ack`.
    fn acknowledge(&mut self, ack: u64) {
        // Echoes arrive in emit order; older entries still queued had their echo dropped.
        while let Some(&(seq, _)) = self.socket_pending.front() {
            if seq >= ack {
                break;
            }
            self.socket_pending.pop_front();
            tracing::warn!(seq, "board update echo lost");
            self.superseded(seq);
        }
        let Some(&(seq, started)) = self.socket_pending.front() else {
            tracing::debug!(ack, "echo for unknown emit");
            return;
        };
        if seq != ack {
            tracing::debug!(ack, "echo for unknown emit");
            return;
        }
        self.socket_pending.pop_front();
        let rtt = started.elapsed();
        self.stats.completed += 1;
        self.stats.rtt_ms.push(rtt.as_secs_f64() * 1000.0);
        self.stats.last_response = Some("dataUpdated".into());
        let _ = self.event_tx.send(SessionEvent::SyncCompleted {
            seq,
            response: "dataUpdated".into(),
            rtt,
        });
    }

    fn on_command(&mut self, cmd: UiCommand, backend: &SyncBackend) -> Result<()> {
        match cmd {
            UiCommand::DragMove { active, over } => {
                match board::apply_drag_move(&self.board, &active, &over) {
                    Ok(next) => {
                        tracing::debug!(
                            item = board::item_title(&self.board, &active),
                            over = over.id(),
                            "item moved"
                        );
                        self.set_board(next);
                    }
                    Err(e) => {
                        tracing::warn!(%active, over = over.id(), error = %e, "drag move ignored");
                        self.info(format!("Move ignored: {e}"));
                    }
                }
            }
            UiCommand::DragEnd { dropped } => {
                self.stats.drags += 1;
                if dropped {
                    self.sync(backend)?;
                } else {
                    tracing::debug!("dropped outside any target, not syncing");
                }
            }
            UiCommand::AddContainer { title, description } => {
                match board::add_container(&self.board, &title, &description) {
                    Ok((next, id)) => {
                        self.set_board(next);
                        self.info(format!("Added container {id}"));
                    }
                    Err(e) => self.info(format!("Add container failed: {e}")),
                }
            }
            UiCommand::AddItem {
                container_id,
                title,
            } => match board::add_item(&self.board, &container_id, &title) {
                Ok((next, id)) => {
                    self.set_board(next);
                    self.info(format!("Added item {id}"));
                }
                Err(e) => self.info(format!("Add item failed: {e}")),
            },
            UiCommand::Quit => {}
        }
        Ok(())
    }
}

async fn next_server_event(backend: &mut SyncBackend, open: bool) -> Option<ServerEvent> {
    match backend {
        SyncBackend::Socket(socket) if open => socket.next_event().await,
        _ => futures::future::pending().await,
    }
}

/// Run a drag session until `Quit` (or the command channel closes) and every
/// in-flight sync has settled.
pub(crate) async fn run_session(
    initial: Board,
    mut backend: SyncBackend,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<SessionOutcome> {
    let mut session = Session {
        board: initial,
        event_tx,
        stats: SessionStats::default(),
        next_seq: 1,
        latest_seq: 0,
        in_flight: FuturesUnordered::new(),
        socket_pending: VecDeque::new(),
    };
    backend.track(&session.board);
    let mut socket_open = matches!(backend, SyncBackend::Socket(_));
    if let SyncBackend::Socket(socket) = &mut backend {
        // The board is only editable once the server's copy has arrived.
        socket
            .emit(ClientEvent::RequestInitialData)
            .context("failed to request initial data")?;
        match socket.next_event().await {
            Some(ev) => session.on_server_event(ev),
            None => anyhow::bail!("board socket closed before initial data arrived"),
        }
    }

    let mut quit_pending = false;
    while !(quit_pending && session.in_flight.is_empty()) {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => match cmd {
                Some(UiCommand::Quit) => {
                    quit_pending = true;
                }
                Some(cmd) => session.on_command(cmd, &backend)?,
                None => {
                    // Nobody left to show results to.
                    if let SyncBackend::Request { runner, .. } = &backend {
                        runner.cancel();
                    }
                    quit_pending = true;
                }
            },
            Some(settled) = session.in_flight.next(), if !session.in_flight.is_empty() => {
                session.settle(settled);
            }
            ev = next_server_event(&mut backend, socket_open) => match ev {
                Some(ev) => session.on_server_event(ev),
                None => {
                    tracing::warn!("board socket closed by peer");
                    socket_open = false;
                }
            },
        }
    }

    match &mut backend {
        SyncBackend::Socket(socket) => {
            // Let the hub work through everything already emitted, then drain the echoes.
            if socket.is_open() {
                socket.close().await;
            }
            while let Some(ev) = socket.next_event().await {
                session.on_server_event(ev);
            }
        }
        SyncBackend::Request { runner, .. } => {
            tracing::debug!(cancelled = runner.superseded_count(), idle = runner.is_idle(), "request runner finished");
        }
    }

    Ok(SessionOutcome {
        board: session.board,
        stats: session.stats,
    })
}
