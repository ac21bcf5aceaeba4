//! Node runtime: threads, channels, and the action executor.
//!
//! One state thread owns every mutable piece of protocol state and drains
//! a single event channel, so no two deliveries (or role transitions) can
//! interleave. Reader threads and timers only ever enqueue events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::config::Config;
use crate::proto::{now_ms, ChatRecord, Envelope, Payload, SeqNo};
use crate::Result;

use super::state::{Action, NodeState};
use super::storage::MessageLog;
use super::transport::{Outbound, Server};

const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum Event {
    /// A decoded frame from any inbound socket (peer or client).
    Inbound(Envelope),
    /// A chat line submitted by the embedding process.
    LocalChat(String),
    Shutdown,
}

/// Receives every message the moment it is delivered in total order.
/// Storage persistence has already succeeded by the time this runs.
pub trait DeliverySink: Send {
    fn deliver(&mut self, record: &ChatRecord);
}

/// Default sink: surface deliveries in the log.
pub struct LogSink;

impl DeliverySink for LogSink {
    fn deliver(&mut self, record: &ChatRecord) {
        tracing::info!(
            seq_no = record.seq_no.get(),
            origin = record.sender_id.get(),
            "[seq={}] node_{}: {}",
            record.seq_no,
            record.sender_id,
            record.text
        );
    }
}

/// A running node. Dropping the handle does not stop the node; call
/// [`NodeHandle::shutdown`].
pub struct NodeHandle {
    shutdown: Arc<AtomicBool>,
    events: Sender<Event>,
    server: Server,
    state_join: JoinHandle<Result<()>>,
    local_addr: std::net::SocketAddr,
}

impl NodeHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Submit a chat message as this node (used by tests and demos; real
    /// clients just open a socket and send a CHAT frame).
    pub fn send_chat(&self, text: impl Into<String>) {
        let _ = self.events.send(Event::LocalChat(text.into()));
    }

    pub fn is_running(&self) -> bool {
        !self.state_join.is_finished()
    }

    /// Stop the node: flush state, close the listener, join threads.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.events.send(Event::Shutdown);
        self.server.join();
        match self.state_join.join() {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("state thread panicked");
                Ok(())
            }
        }
    }
}

/// Start a node and return a handle to it.
///
/// Startup order follows recovery-before-traffic: load the message log to
/// seed `last_seq`, bind the listener, then join the cluster.
pub fn start(config: Config, sink: Box<dyn DeliverySink>) -> Result<NodeHandle> {
    let mut storage = MessageLog::open(&config.log_dir, config.node_id)?;
    let recovered = storage.load_all()?;
    let last_seq = recovered
        .iter()
        .map(|record| record.seq_no)
        .max()
        .unwrap_or(SeqNo::ZERO);
    tracing::info!(
        records = recovered.len(),
        last_seq = last_seq.get(),
        "recovered message log"
    );

    let mut state = NodeState::new(&config, now_ms());
    for record in &recovered {
        state.recover_record(record.seq_no, record.term);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (event_tx, event_rx) = unbounded();

    let server = Server::start(
        &config.listen_addr(),
        &config.limits,
        event_tx.clone(),
        Arc::clone(&shutdown),
    )?;
    let local_addr = server.local_addr();

    let outbound = Outbound::new(config.limits.clone(), Arc::clone(&shutdown));
    let catchup_batch = config.limits.catchup_batch;
    let state_join = thread::spawn(move || {
        run_state_loop(state, storage, outbound, event_rx, sink, catchup_batch)
    });

    tracing::info!(
        node_id = config.node_id.get(),
        addr = %local_addr,
        "node started"
    );
    Ok(NodeHandle {
        shutdown,
        events: event_tx,
        server,
        state_join,
        local_addr,
    })
}

/// Run a node until SIGINT/SIGTERM. This is the `totem run` entrypoint.
pub fn run(config: Config, sink: Box<dyn DeliverySink>) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop));

    let handle = start(config, sink)?;
    while !stop.load(Ordering::Relaxed) {
        if !handle.is_running() {
            // The state thread only exits early on a fatal error
            // (storage); surface it as the process result.
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutting down");
    handle.shutdown()
}

fn run_state_loop(
    mut state: NodeState,
    mut storage: MessageLog,
    mut outbound: Outbound,
    events: Receiver<Event>,
    mut sink: Box<dyn DeliverySink>,
    catchup_batch: usize,
) -> Result<()> {
    let ticker = crossbeam::channel::tick(TICK_INTERVAL);

    let startup = state.start(now_ms());
    if let Err(err) = execute(
        startup,
        &mut storage,
        &mut outbound,
        &state,
        &mut sink,
        catchup_batch,
    ) {
        outbound.shutdown();
        return Err(err);
    }

    loop {
        let actions = crossbeam::select! {
            recv(events) -> event => match event {
                Ok(Event::Inbound(envelope)) => state.handle_message(envelope, now_ms()),
                Ok(Event::LocalChat(text)) => state.submit_chat(text, now_ms()),
                Ok(Event::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => state.tick(now_ms()),
        };

        if let Err(err) = execute(
            actions,
            &mut storage,
            &mut outbound,
            &state,
            &mut sink,
            catchup_batch,
        ) {
            outbound.shutdown();
            return Err(err);
        }
    }

    outbound.shutdown();
    tracing::info!("node stopped");
    Ok(())
}

fn execute(
    actions: Vec<Action>,
    storage: &mut MessageLog,
    outbound: &mut Outbound,
    state: &NodeState,
    sink: &mut Box<dyn DeliverySink>,
    catchup_batch: usize,
) -> Result<()> {
    for action in actions {
        match action {
            Action::Send { to, msg } => outbound.send_to(&to, msg),
            Action::Broadcast { to, msg } => outbound.broadcast(&to, &msg),
            Action::Deliver(record) => {
                // Refusing to deliver what cannot be persisted keeps the
                // total order intact across a restart.
                storage.append(&record)?;
                sink.deliver(&record);
            }
            Action::Catchup { to, since_seq } => {
                let records = storage.records_after(since_seq)?;
                if records.is_empty() {
                    // Still answer so the requester learns it is current.
                    let resp = Envelope::new(
                        state.self_id(),
                        state.current_term(),
                        Payload::CatchupResp {
                            messages: Vec::new(),
                        },
                    );
                    outbound.send_to(&to, resp);
                    continue;
                }
                for batch in records.chunks(catchup_batch.max(1)) {
                    let resp = Envelope::new(
                        state.self_id(),
                        state.current_term(),
                        Payload::CatchupResp {
                            messages: batch.to_vec(),
                        },
                    );
                    outbound.send_to(&to, resp);
                }
            }
        }
    }
    Ok(())
}
