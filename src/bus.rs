//! Bus dispatcher: exclusive owner of the serial transport.
//!
//! One dedicated worker services explicit send requests scheduled by nodes
//! and, when idle, round-robins a poll of every registered node. All
//! protocol state (parser accumulator, CRC engine, frame scratch) is
//! private to the worker; the registry and the schedule queue are the only
//! objects shared with application threads.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use snafu::{ensure, ResultExt};

use crate::crc::Crc16;
use crate::frame::{
    data_frame, request_frame, RequestKind, ACK0, ACK0_SEQ, ACK1, ACK1_SEQ, EOT, NAK_SEQ,
};
use crate::nom_parser::{parse_reply, Buffer, ReplyToken};
use crate::node::{Node, NodeShared};
use crate::transport::Transport;
use crate::types::{
    DuplicateAddressSnafu, Error, IntoAddress, IoSnafu, StartupTimeoutSnafu, TimeoutSnafu,
};

/// Attempt budget shared by the select/send and poll state machines.
const RETRY_LIMIT: u32 = 3;
/// How long the worker waits for scheduled work before sweeping a poll of
/// every registered node.
const DEFAULT_IDLE_PERIOD: Duration = Duration::from_millis(2000);
/// How long `start` waits for the worker's ready signal.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);
/// At most this many payload bytes are staged per data frame; a larger
/// backlog drains across successive exchanges.
const MAX_FRAME_PAYLOAD: usize = 512;
/// Default per-direction node buffer capacity.
const DEFAULT_NODE_BUFFER_SIZE: usize = 512;

/// Master station for one multidrop BISYNC link.
///
/// The bus owns the transport exclusively: [`start`](Bus::start) opens it
/// and hands it to the dispatcher worker, [`stop`](Bus::stop) joins the
/// worker, closes the transport and clears the node registry. Recreate
/// nodes with [`create_node`](Bus::create_node) after a restart; handles
/// from before the stop are no longer serviced.
#[derive(Debug)]
pub struct Bus<T: Transport + 'static> {
    shared: Arc<BusShared>,
    transport: Option<T>,
    worker: Option<JoinHandle<T>>,
    read_timeout: Duration,
    idle_period: Duration,
}

impl<T: Transport + 'static> Bus<T> {
    /// Create a stopped bus. `read_timeout` bounds every wait for a reply
    /// frame on the wire.
    pub fn new(transport: T, read_timeout: Duration) -> Bus<T> {
        Bus {
            shared: BusShared::new(),
            transport: Some(transport),
            worker: None,
            read_timeout,
            idle_period: DEFAULT_IDLE_PERIOD,
        }
    }

    /// Override the idle period after which the worker polls all nodes.
    /// Takes effect on the next [`start`](Bus::start).
    pub fn set_idle_period(&mut self, idle_period: Duration) {
        self.idle_period = idle_period;
    }

    /// Open the transport and launch the dispatcher worker. Waits for the
    /// worker's ready signal. No-op if the bus is already running.
    ///
    /// # Errors
    /// [`Error::Io`] if the transport fails to open,
    /// [`Error::StartupTimeout`] if the worker never signals readiness.
    pub fn start(&mut self) -> Result<(), Error> {
        let mut transport = match self.transport.take() {
            Some(transport) => transport,
            None => return Ok(()),
        };

        info!("starting bus dispatcher");
        if let Err(source) = transport.open() {
            self.transport = Some(transport);
            return Err(Error::Io { source });
        }
        self.shared.reset_stop();

        let (ready_tx, ready_rx) = mpsc::channel();
        let dispatcher = Dispatcher {
            transport,
            shared: Arc::clone(&self.shared),
            crc: Crc16::new(),
            rx: Buffer::new(),
            read_timeout: self.read_timeout,
            idle_period: self.idle_period,
        };
        let handle = thread::Builder::new()
            .name("bisync-dispatcher".into())
            .spawn(move || dispatcher.run(ready_tx))
            .context(IoSnafu)?;
        self.worker = Some(handle);

        if ready_rx.recv_timeout(STARTUP_TIMEOUT).is_err() {
            error!("unable to start the dispatcher worker");
            self.halt_worker();
            return StartupTimeoutSnafu.fail();
        }
        Ok(())
    }

    /// Signal the worker to exit, join it, close the transport and clear
    /// the registry and schedule. No-op if the bus is stopped.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        info!("stopping bus dispatcher");
        self.halt_worker();
        self.shared.clear();
    }

    /// Register a node with dedicated buffer capacities.
    ///
    /// # Errors
    /// [`Error::DuplicateAddress`] if the address is already registered,
    /// [`Error::InvalidAddress`] for an out-of-range address.
    pub fn create_node(
        &self,
        address: impl IntoAddress,
        in_capacity: usize,
        out_capacity: usize,
    ) -> Result<Node, Error> {
        let address = address.into_address()?;
        let shared = Arc::new(NodeShared::new(address, in_capacity, out_capacity));
        self.shared.register(Arc::clone(&shared))?;
        Ok(Node::new(shared, Arc::clone(&self.shared)))
    }

    /// Register a node with 512-byte buffers in each direction.
    pub fn create_node_default(&self, address: impl IntoAddress) -> Result<Node, Error> {
        self.create_node(address, DEFAULT_NODE_BUFFER_SIZE, DEFAULT_NODE_BUFFER_SIZE)
    }

    fn halt_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.signal_stop();
            match handle.join() {
                Ok(mut transport) => {
                    transport.close();
                    self.transport = Some(transport);
                }
                Err(_) => error!("dispatcher worker panicked"),
            }
        }
    }
}

impl<T: Transport + 'static> Drop for Bus<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State shared between the application-facing API and the worker: the
/// node registry and the deduplicated FIFO of nodes awaiting transmission.
/// The queue length is the counting signal the worker waits on.
#[derive(Debug)]
pub(crate) struct BusShared {
    registry: Mutex<Vec<Arc<NodeShared>>>,
    sched: Mutex<Sched>,
    sched_cv: Condvar,
}

#[derive(Debug)]
struct Sched {
    queue: VecDeque<Arc<NodeShared>>,
    stop: bool,
}

enum Wake {
    Stop,
    Work(Arc<NodeShared>),
    Idle,
}

impl BusShared {
    fn new() -> Arc<BusShared> {
        Arc::new(BusShared {
            registry: Mutex::new(Vec::new()),
            sched: Mutex::new(Sched {
                queue: VecDeque::new(),
                stop: true,
            }),
            sched_cv: Condvar::new(),
        })
    }

    /// Queue a node for transmission. Idempotent: a node already queued is
    /// not queued twice.
    pub(crate) fn schedule_send(&self, node: &Arc<NodeShared>) {
        let mut sched = lock(&self.sched);
        if !sched.queue.iter().any(|queued| Arc::ptr_eq(queued, node)) {
            sched.queue.push_back(Arc::clone(node));
            self.sched_cv.notify_all();
        }
    }

    /// Remove a node from the pending queue if the worker has not dequeued
    /// it yet; losing that race means an at-least-once attempt.
    pub(crate) fn cancel_send(&self, node: &Arc<NodeShared>) {
        lock(&self.sched)
            .queue
            .retain(|queued| !Arc::ptr_eq(queued, node));
    }

    pub(crate) fn remove_node(&self, node: &Arc<NodeShared>) {
        lock(&self.registry).retain(|registered| !Arc::ptr_eq(registered, node));
    }

    fn register(&self, node: Arc<NodeShared>) -> Result<(), Error> {
        let mut registry = lock(&self.registry);
        ensure!(
            registry
                .iter()
                .all(|registered| registered.address != node.address),
            DuplicateAddressSnafu {
                address: *node.address
            }
        );
        registry.push(node);
        Ok(())
    }

    fn nodes_snapshot(&self) -> Vec<Arc<NodeShared>> {
        lock(&self.registry).clone()
    }

    fn signal_stop(&self) {
        lock(&self.sched).stop = true;
        self.sched_cv.notify_all();
    }

    fn reset_stop(&self) {
        lock(&self.sched).stop = false;
    }

    fn clear(&self) {
        lock(&self.registry).clear();
        lock(&self.sched).queue.clear();
    }

    /// Dual wait of the worker loop: stop requested, a node scheduled, or
    /// the idle period elapsed.
    fn next_event(&self, idle: Duration) -> Wake {
        let deadline = Instant::now() + idle;
        let mut sched = lock(&self.sched);
        loop {
            if sched.stop {
                return Wake::Stop;
            }
            if let Some(node) = sched.queue.pop_front() {
                return Wake::Work(node);
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Idle;
            }
            sched = match self.sched_cv.wait_timeout(sched, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A complete frame received from a secondary station.
enum Reply {
    Command(u8),
    Data {
        payload: Vec<u8>,
        terminator: u8,
        crc: u16,
    },
}

enum SendOutcome {
    /// Data transmitted and acknowledged (or nothing left to transmit).
    Done,
    /// The station never acknowledged the select request.
    SelectFailed,
    /// Selected, but the data exchange exhausted its retries.
    DataFailed,
    /// The node was closed while the exchange was in flight.
    NodeGone,
}

enum PollStage {
    Request,
    Await,
    Ack,
}

/// The worker: owns the transport and all per-frame scratch state.
struct Dispatcher<T: Transport> {
    transport: T,
    shared: Arc<BusShared>,
    crc: Crc16,
    rx: Buffer,
    read_timeout: Duration,
    idle_period: Duration,
}

impl<T: Transport> Dispatcher<T> {
    fn run(mut self, ready: mpsc::Sender<()>) -> T {
        let _ = ready.send(());
        loop {
            match self.shared.next_event(self.idle_period) {
                Wake::Stop => return self.transport,
                Wake::Work(node) => self.service(node),
                Wake::Idle => {
                    for node in self.shared.nodes_snapshot() {
                        self.poll_slave(&node);
                    }
                }
            }
        }
    }

    fn service(&mut self, node: Arc<NodeShared>) {
        match self.send_to_slave(&node) {
            SendOutcome::Done => self.poll_slave(&node),
            SendOutcome::DataFailed => {
                warn!(
                    "data transfer to slave {} failed, will retry later",
                    node.address
                );
                // A successful select consumed the bus turn; complete it
                // with a poll before giving the data another pass.
                self.poll_slave(&node);
                self.shared.schedule_send(&node);
            }
            SendOutcome::SelectFailed => {
                debug!("error selecting slave {}", node.address);
                self.shared.schedule_send(&node);
            }
            SendOutcome::NodeGone => {}
        }
    }

    /// Two-stage exchange: select the station, then transmit the staged
    /// bytes until they are acknowledged with ACK1. The staged bytes are
    /// only popped from the outbound ring after that acknowledgment, so a
    /// retry re-presents exactly the same frame.
    fn send_to_slave(&mut self, node: &Arc<NodeShared>) -> SendOutcome {
        trace!("attempting to select slave {}", node.address);
        if !self.select_slave(node) {
            return SendOutcome::SelectFailed;
        }

        let mut chunk = [0u8; MAX_FRAME_PAYLOAD];
        let mut retries = RETRY_LIMIT;
        while retries > 0 {
            let staged = match node.outbound.peek(&mut chunk, Some(Duration::ZERO)) {
                Ok(0) => return SendOutcome::Done,
                Ok(len) => len,
                Err(_) => return SendOutcome::NodeGone,
            };
            trace!("data snd {}", hex(&chunk[..staged]));
            let frame = data_frame(&chunk[..staged]);
            match self.exchange(&frame) {
                Ok(Reply::Command(reply)) if reply == ACK1 => {
                    if node.outbound.pop(staged).is_err() {
                        return SendOutcome::NodeGone;
                    }
                    return SendOutcome::Done;
                }
                Ok(_) | Err(_) => retries -= 1,
            }
        }
        SendOutcome::DataFailed
    }

    /// Select handshake: one request, one reply, no retry. Anything but a
    /// command reply of ACK0 is a failure.
    fn select_slave(&mut self, node: &Arc<NodeShared>) -> bool {
        let request = request_frame(RequestKind::Select, node.address);
        matches!(self.exchange(&request), Ok(Reply::Command(reply)) if reply == ACK0)
    }

    /// Poll cycle: request, receive, acknowledge, repeat until the station
    /// reports EOT or the retry budget runs out. The acknowledgment parity
    /// toggles per accepted frame so the station can detect duplicates.
    fn poll_slave(&mut self, node: &Arc<NodeShared>) {
        let request = request_frame(RequestKind::Poll, node.address);
        let mut retries = RETRY_LIMIT;
        let mut accepted: u8 = 0;
        let mut stage = PollStage::Request;

        while retries > 0 {
            stage = match stage {
                PollStage::Request => {
                    self.send_only(&request);
                    PollStage::Await
                }
                PollStage::Await => match self.receive_reply() {
                    Ok(Reply::Data {
                        payload,
                        terminator,
                        crc,
                    }) => {
                        self.crc.init();
                        self.crc.update_slice(&payload);
                        self.crc.update(terminator);
                        let expected = self.crc.end();
                        if crc != expected {
                            warn!("CRC error {:04X} {:04X}", crc, expected);
                            self.send_only(&NAK_SEQ);
                            retries -= 1;
                            PollStage::Request
                        } else {
                            match node.inbound.put(&payload, Some(Duration::ZERO)) {
                                Ok(true) => {
                                    accepted = accepted.wrapping_add(1);
                                    PollStage::Ack
                                }
                                // A frame the ring cannot take right now, or
                                // ever: refuse it so the station knows.
                                Ok(false) | Err(Error::OutOfRange) => {
                                    warn!("inbound queue overflow on node {}", node.address);
                                    self.send_only(&NAK_SEQ);
                                    return;
                                }
                                Err(_) => return,
                            }
                        }
                    }
                    Ok(Reply::Command(reply)) if reply == EOT => return,
                    Ok(Reply::Command(_)) | Err(_) => {
                        retries -= 1;
                        PollStage::Request
                    }
                },
                PollStage::Ack => {
                    let ack = if accepted & 1 == 0 { &ACK0_SEQ } else { &ACK1_SEQ };
                    self.send_only(ack);
                    PollStage::Await
                }
            };
        }
        debug!("giving up polling slave {}", node.address);
    }

    /// Transmit without expecting a reply, pipelining the next leg of the
    /// exchange. Write errors are diagnostic only; the retry logic will
    /// observe the missing reply.
    fn send_only(&mut self, frame: &[u8]) {
        trace!("tx frame {}", hex(frame));
        if let Err(err) = self.transport.write(frame) {
            warn!("bus write error: {}", err);
        }
    }

    /// Transmit, then wait synchronously for one complete reply frame.
    fn exchange(&mut self, frame: &[u8]) -> Result<Reply, Error> {
        trace!("tx frame {}", hex(frame));
        self.transport.write(frame).context(IoSnafu)?;
        self.receive_reply()
    }

    /// Read from the transport until the parser yields a full frame or the
    /// read timeout elapses. The accumulator is reset per call: a frame
    /// never spans dispatch iterations.
    fn receive_reply(&mut self) -> Result<Reply, Error> {
        self.rx.clear();
        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = [0u8; 64];
        loop {
            let (consumed, token) = parse_reply(self.rx.as_ref());
            self.rx.consume(consumed);
            match token {
                ReplyToken::Command(byte) => {
                    trace!("rx cmd {:02X}", byte);
                    return Ok(Reply::Command(byte));
                }
                ReplyToken::Data {
                    payload,
                    terminator,
                    crc,
                } => {
                    trace!("rx pkt {}", hex(&payload));
                    return Ok(Reply::Data {
                        payload,
                        terminator,
                        crc,
                    });
                }
                ReplyToken::NeedData => {}
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("error reading a frame from the bus");
                return TimeoutSnafu.fail();
            }
            let read = self
                .transport
                .read(&mut chunk, deadline - now)
                .context(IoSnafu)?;
            if read != 0 {
                self.rx.write(&chunk[..read]);
            }
        }
    }
}

fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02X}", byte);
    }
    out
}
