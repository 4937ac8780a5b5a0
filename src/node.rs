//! Address-scoped node handle.
//!
//! A [`Node`] is a thin facade over a pair of [`BoundedBuffer`]s: `send`
//! stages bytes into the outbound ring and asks the bus to schedule the
//! node, `receive` drains the inbound ring. All synchronization lives in
//! the buffers and the bus registry.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use snafu::ensure;

use crate::buffer::BoundedBuffer;
use crate::bus::BusShared;
use crate::types::{Address, DisposedSnafu, Error, TimeoutSnafu};

/// Bus-internal per-node state: the address and the two rings, shared
/// between the application handle and the dispatcher worker.
#[derive(Debug)]
pub(crate) struct NodeShared {
    pub(crate) address: Address,
    pub(crate) inbound: BoundedBuffer,
    pub(crate) outbound: BoundedBuffer,
    pub(crate) closed: AtomicBool,
}

impl NodeShared {
    pub(crate) fn new(address: Address, in_capacity: usize, out_capacity: usize) -> NodeShared {
        NodeShared {
            address,
            inbound: BoundedBuffer::new(in_capacity),
            outbound: BoundedBuffer::new(out_capacity),
            closed: AtomicBool::new(false),
        }
    }
}

/// Handle to one secondary station on the bus.
///
/// Created by [`Bus::create_node`](crate::Bus::create_node); closing (or
/// dropping) the handle deregisters the address and releases both buffers,
/// failing any blocked callers with [`Error::Closed`].
#[derive(Debug)]
pub struct Node {
    shared: Arc<NodeShared>,
    bus: Arc<BusShared>,
}

impl Node {
    pub(crate) fn new(shared: Arc<NodeShared>, bus: Arc<BusShared>) -> Node {
        Node { shared, bus }
    }

    /// The node's link address.
    pub fn address(&self) -> Address {
        self.shared.address
    }

    /// Stage `data` for transmission and schedule this node with the
    /// dispatcher. Blocks until the outbound ring accepts the whole slice
    /// or `timeout` elapses.
    ///
    /// # Errors
    /// [`Error::Timeout`] if the ring stayed too full, [`Error::Disposed`]
    /// after [`close`](Self::close), [`Error::OutOfRange`] if `data`
    /// exceeds the ring capacity.
    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        ensure!(!self.shared.closed.load(SeqCst), DisposedSnafu);
        let accepted = self.shared.outbound.put(data, timeout)?;
        ensure!(accepted, TimeoutSnafu);
        self.bus.schedule_send(&self.shared);
        Ok(())
    }

    /// Drain received bytes into `buf`, blocking up to `timeout`. Returns
    /// the number of bytes copied, 0 on timeout.
    ///
    /// # Errors
    /// [`Error::Disposed`] after [`close`](Self::close).
    pub fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        ensure!(!self.shared.closed.load(SeqCst), DisposedSnafu);
        self.shared.inbound.get(buf, timeout)
    }

    /// Deregister the node and close both buffers. Idempotent; also runs
    /// on drop.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, SeqCst) {
            self.bus.cancel_send(&self.shared);
            self.bus.remove_node(&self.shared);
            self.shared.outbound.close();
            self.shared.inbound.close();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.close();
    }
}
