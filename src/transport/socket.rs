//! Realtime board channel.
//!
//! A [`BoardSocket`] is an explicitly opened, explicitly closed connection
//! object owned by whoever needs it. Clients emit [`ClientEvent`]s and receive
//! [`ServerEvent`]s. The [`LoopbackHub`] is an in-process backend standing in
//! for the realtime server: it remembers the last board and rebroadcasts every
//! update to all open sockets.
//!
//! Each update carries the sender's sequence number. Only the socket that sent
//! it sees that number again, as the `ack` of its `DataUpdated` echo; every
//! other socket receives the board with no `ack`.

use crate::model::Board;
use crate::transport::TransportError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    RequestInitialData,
    UpdatedItems { seq: u64, board: Board },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    InitialData(Board),
    /// `ack` is the `seq` of our own `UpdatedItems` this echoes, `None` for
    /// another client's update.
    DataUpdated { board: Board, ack: Option<u64> },
}

/// An applied update as broadcast to every socket on the hub.
#[derive(Debug, Clone)]
struct HubUpdate {
    client: u64,
    seq: u64,
    board: Board,
}

impl HubUpdate {
    fn for_client(self, client: u64) -> ServerEvent {
        ServerEvent::DataUpdated {
            ack: (self.client == client).then_some(self.seq),
            board: self.board,
        }
    }
}

struct HubInner {
    board: Mutex<Board>,
    updates: broadcast::Sender<HubUpdate>,
    next_client: AtomicU64,
    latency: Duration,
    jitter: Duration,
}

#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new(initial: Board, latency: Duration, jitter: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                board: Mutex::new(initial),
                updates,
                next_client: AtomicU64::new(1),
                latency,
                jitter,
            }),
        }
    }

    /// The board as the hub currently knows it.
    pub fn board(&self) -> Board {
        self.inner
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.inner.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.inner.latency + Duration::from_millis(extra)
    }

    async fn handle(&self, client: u64, event: ClientEvent, reply: &mpsc::UnboundedSender<ServerEvent>) {
        match event {
            ClientEvent::RequestInitialData => {
                let _ = reply.send(ServerEvent::InitialData(self.board()));
            }
            ClientEvent::UpdatedItems { seq, board } => {
                tokio::time::sleep(self.delay()).await;
                *self
                    .inner
                    .board
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = board.clone();
                tracing::trace!(client, seq, items = board.item_count(), "hub broadcasting update");
                // No receivers just means every socket has closed.
                let _ = self.inner.updates.send(HubUpdate { client, seq, board });
            }
        }
    }
}

/// One connection to a [`LoopbackHub`].
pub struct BoardSocket {
    client: u64,
    outgoing: Option<mpsc::UnboundedSender<ClientEvent>>,
    incoming: mpsc::UnboundedReceiver<ServerEvent>,
    task: Option<JoinHandle<()>>,
}

impl BoardSocket {
    pub fn open(hub: &LoopbackHub) -> Self {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let mut updates = hub.inner.updates.subscribe();
        let client = hub.inner.next_client.fetch_add(1, Ordering::Relaxed);
        let hub = hub.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = out_rx.recv() => match ev {
                        Some(ev) => hub.handle(client, ev, &in_tx).await,
                        None => {
                            // Forward echoes of our own last emits before shutting down.
                            while let Ok(upd) = updates.try_recv() {
                                let _ = in_tx.send(upd.for_client(client));
                            }
                            break;
                        }
                    },
                    upd = updates.recv() => match upd {
                        Ok(upd) => {
                            if in_tx.send(upd.for_client(client)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "socket lagged behind hub updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        tracing::debug!(client, "board socket opened");
        Self {
            client,
            outgoing: Some(out_tx),
            incoming: in_rx,
            task: Some(task),
        }
    }

    pub fn is_open(&self) -> bool {
        self.outgoing.is_some()
    }

    pub fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(event).map_err(|_| TransportError::Closed)
    }

    /// Next event from the hub; `None` once the socket is closed and drained.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.incoming.recv().await
    }

    /// Stop sending, let the hub finish what was already emitted, then shut down.
    pub async fn close(&mut self) {
        self.outgoing.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::debug!(client = self.client, "board socket closed");
    }
}

impl Drop for BoardSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Container;

    fn board(title: &str) -> Board {
        Board {
            containers: vec![Container {
                id: "container-1".into(),
                title: title.into(),
                description: String::new(),
                position: 0,
                items: Vec::new(),
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_data_is_sent_only_to_requester() {
        let hub = LoopbackHub::new(board("start"), Duration::ZERO, Duration::ZERO);
        let mut a = BoardSocket::open(&hub);
        let mut b = BoardSocket::open(&hub);

        a.emit(ClientEvent::RequestInitialData).unwrap();
        assert_eq!(a.next_event().await, Some(ServerEvent::InitialData(board("start"))));

        b.close().await;
        assert_eq!(b.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_are_broadcast_to_every_socket_after_latency() {
        let hub = LoopbackHub::new(board("start"), Duration::from_millis(40), Duration::ZERO);
        let mut a = BoardSocket::open(&hub);
        let mut b = BoardSocket::open(&hub);
        let start = tokio::time::Instant::now();

        a.emit(ClientEvent::UpdatedItems {
            seq: 7,
            board: board("moved"),
        })
        .unwrap();

        assert_eq!(
            a.next_event().await,
            Some(ServerEvent::DataUpdated {
                board: board("moved"),
                ack: Some(7),
            })
        );
        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::DataUpdated {
                board: board("moved"),
                ack: None,
            })
        );
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(hub.board(), board("moved"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_seq_from_two_clients_is_acked_only_to_its_sender() {
        let hub = LoopbackHub::new(board("start"), Duration::ZERO, Duration::ZERO);
        let mut a = BoardSocket::open(&hub);
        let mut b = BoardSocket::open(&hub);

        b.emit(ClientEvent::UpdatedItems {
            seq: 1,
            board: board("from-b"),
        })
        .unwrap();
        assert_eq!(
            a.next_event().await,
            Some(ServerEvent::DataUpdated {
                board: board("from-b"),
                ack: None,
            })
        );

        a.emit(ClientEvent::UpdatedItems {
            seq: 1,
            board: board("from-a"),
        })
        .unwrap();
        assert_eq!(
            a.next_event().await,
            Some(ServerEvent::DataUpdated {
                board: board("from-a"),
                ack: Some(1),
            })
        );
        assert!(matches!(
            b.next_event().await,
            Some(ServerEvent::DataUpdated { ack: Some(1), .. })
        ));
        assert_eq!(
            b.next_event().await,
            Some(ServerEvent::DataUpdated {
                board: board("from-a"),
                ack: None,
            })
        );
    }

    #[tokio::test]
    async fn emit_after_close_fails() {
        let hub = LoopbackHub::new(Board::default(), Duration::ZERO, Duration::ZERO);
        let mut socket = BoardSocket::open(&hub);
        assert!(socket.is_open());
        socket.close().await;
        assert!(!socket.is_open());
        assert!(matches!(
            socket.emit(ClientEvent::RequestInitialData),
            Err(TransportError::Closed)
        ));
    }
}
