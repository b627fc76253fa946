use crate::model::{Board, DropTarget, SessionEvent, SyncConfig, TransportKind};
use crate::orchestrator::{self, SyncBackend, UiCommand};
use crate::sequential::SupersededPolicy;
use crate::transport::{BoardSocket, LoopbackHub, RestClient};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "board-sync",
    version,
    about = "Kanban board client with drag-and-drop sync over REST or a realtime channel"
)]
pub struct Cli {
    /// Base URL of the board backend
    #[arg(long, global = true, default_value = "http://localhost:3000")]
    pub base_url: String,

    /// Bearer token sent with every REST request
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Per-request timeout for REST calls
    #[arg(long, global = true, default_value = "10s")]
    pub request_timeout: humantime::Duration,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Log sync activity to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print a board snapshot file
    Show {
        /// Board JSON file (array of containers)
        #[arg(long)]
        board: PathBuf,
    },
    /// Fetch the board from the REST backend
    Fetch {
        /// Also write the fetched board to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Send the item order of a board file to the REST backend once
    Push {
        #[arg(long)]
        board: PathBuf,
    },
    /// Replay drags against a board, syncing after every drop
    Drag(DragArgs),
}

#[derive(Debug, clap::Args, Clone)]
pub struct DragArgs {
    /// Board JSON file; fetched from the backend when omitted (REST only)
    #[arg(long)]
    pub board: Option<PathBuf>,

    /// A drag, as ACTIVE_ITEM:TARGET where TARGET is an item or container id.
    /// Repeat to replay several drags in order.
    #[arg(long = "move", value_name = "ITEM:TARGET", value_parser = parse_drag, required = true)]
    pub moves: Vec<DragSpec>,

    /// Sync transport
    #[arg(long, value_enum, default_value_t = TransportArg::Rest)]
    pub transport: TransportArg,

    /// Pause between drags; keep it short to see superseded syncs
    #[arg(long, default_value = "0s")]
    pub interval: humantime::Duration,

    /// Loopback transport: latency before the hub echoes an update
    #[arg(long, default_value = "50ms")]
    pub latency: humantime::Duration,

    /// Loopback transport: random extra latency up to this much
    #[arg(long, default_value = "0s")]
    pub jitter: humantime::Duration,

    /// Hand stale results to their callers instead of rejecting them
    #[arg(long)]
    pub deliver_superseded: bool,

    /// Export the session report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportArg {
    Rest,
    Loopback,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Rest => TransportKind::Rest,
            TransportArg::Loopback => TransportKind::Loopback,
        }
    }
}

/// One replayed drag: `active` ends up dropped on `over`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragSpec {
    pub active: String,
    pub over: DropTarget,
}

/// Parse `item-1:container-2` style drag specs.
fn parse_drag(s: &str) -> Result<DragSpec, String> {
    let (active, target) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ITEM:TARGET, got '{s}'"))?;
    let active = active.trim();
    if active.is_empty() {
        return Err(format!("missing item id in '{s}'"));
    }
    let over = DropTarget::from_id(target.trim())
        .ok_or_else(|| format!("target '{target}' is neither an item- nor a container- id"))?;
    Ok(DragSpec {
        active: active.to_string(),
        over,
    })
}

pub async fn run(args: Cli) -> Result<()> {
    match args.command.clone() {
        Command::Show { board } => {
            let board = load_board(&board)?;
            print_board(&args, &board)
        }
        Command::Fetch { output } => {
            let client = RestClient::new(&build_config(&args, None))?;
            let board = client.fetch_board().await.context("failed to fetch board")?;
            if let Some(path) = output.as_deref() {
                save_board(path, &board)?;
            }
            print_board(&args, &board)
        }
        Command::Push { board } => run_push(&args, &board).await,
        Command::Drag(drag) => run_drag(&args, &drag).await,
    }
}

/// Build a `SyncConfig` from CLI arguments.
pub fn build_config(args: &Cli, drag: Option<&DragArgs>) -> SyncConfig {
    SyncConfig {
        base_url: args.base_url.clone(),
        bearer_token: args.token.clone(),
        transport: drag.map(|d| d.transport.into()).unwrap_or(TransportKind::Rest),
        request_timeout: Duration::from(args.request_timeout),
        simulated_latency: drag.map(|d| Duration::from(d.latency)).unwrap_or_default(),
        simulated_jitter: drag.map(|d| Duration::from(d.jitter)).unwrap_or_default(),
        drag_interval: drag.map(|d| Duration::from(d.interval)).unwrap_or_default(),
        deliver_superseded: drag.map(|d| d.deliver_superseded).unwrap_or(false),
        user_agent: format!("board-sync/{}", env!("CARGO_PKG_VERSION")),
    }
}

fn load_board(path: &Path) -> Result<Board> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a board", path.display()))
}

fn save_board(path: &Path, board: &Board) -> Result<()> {
    let json = serde_json::to_string_pretty(board)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn print_board(args: &Cli, board: &Board) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(board)?);
    } else {
        for line in crate::text_summary::board_lines(board) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_push(args: &Cli, path: &Path) -> Result<()> {
    let board = load_board(path)?;
    let client = RestClient::new(&build_config(args, None))?;

    // Ctrl-C aborts the request instead of killing the process mid-write.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = client.update_items_order(&board, &cancel).await;
    signal_task.abort();
    let response = result.context("failed to update items order")?;
    if !response.trim().is_empty() {
        println!("{}", response.trim());
    }
    Ok(())
}

async fn run_drag(args: &Cli, drag: &DragArgs) -> Result<()> {
    let cfg = build_config(args, Some(drag));
    let policy = if cfg.deliver_superseded {
        SupersededPolicy::Deliver
    } else {
        SupersededPolicy::Reject
    };

    let (board, backend) = match cfg.transport {
        TransportKind::Rest => {
            let client = RestClient::new(&cfg)?;
            let board = match drag.board.as_deref() {
                Some(path) => load_board(path)?,
                None => client
                    .fetch_board()
                    .await
                    .context("failed to fetch initial board")?,
            };
            (board, SyncBackend::rest(client, policy))
        }
        TransportKind::Loopback => {
            let path = drag
                .board
                .as_deref()
                .context("--board is required with the loopback transport")?;
            let board = load_board(path)?;
            let hub = LoopbackHub::new(board.clone(), cfg.simulated_latency, cfg.simulated_jitter);
            (board, SyncBackend::Socket(BoardSocket::open(&hub)))
        }
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let session = tokio::spawn(orchestrator::run_session(board, backend, evt_tx, cmd_rx));

    let moves = drag.moves.clone();
    let interval = cfg.drag_interval;
    let driver = tokio::spawn(async move {
        for spec in moves {
            let _ = cmd_tx.send(UiCommand::DragMove {
                active: spec.active,
                over: spec.over,
            });
            let _ = cmd_tx.send(UiCommand::DragEnd { dropped: true });
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        let _ = cmd_tx.send(UiCommand::Quit);
    });

    while let Some(ev) = evt_rx.recv().await {
        if args.json {
            continue;
        }
        let line = match ev {
            SessionEvent::SyncStarted { seq } => format!("sync #{seq} started"),
            SessionEvent::SyncCompleted { seq, rtt, .. } => {
                format!("sync #{seq} completed in {:.1} ms", rtt.as_secs_f64() * 1000.0)
            }
            SessionEvent::SyncSuperseded { seq } => format!("sync #{seq} superseded"),
            SessionEvent::SyncFailed { seq, error } => format!("sync #{seq} failed: {error}"),
            SessionEvent::Info(msg) => msg,
            SessionEvent::BoardChanged { .. } => continue,
        };
        let _ = out_tx.send(OutputLine::Stderr(line));
    }

    let _ = driver.await;
    let outcome = session
        .await
        .context("drag session task failed")?
        .context("drag session failed")?;

    let report = orchestrator::build_report(&outcome, cfg.transport);
    if let Some(path) = drag.export_json.as_deref() {
        orchestrator::export_json(path, &report)?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Exported JSON: {}", path.display())));
    }

    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&report)?));
    } else {
        for line in crate::text_summary::build_text_summary(&report).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}
