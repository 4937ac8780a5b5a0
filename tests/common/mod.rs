//! In-memory link with scripted secondary stations.
//!
//! `sim_pair` yields a [`SimLink`] for the bus and a [`SimHandle`] for the
//! test body. The link replies to master frames synchronously: every
//! `write` runs the addressed station's script and queues the reply bytes
//! for the next `read`, so test runs are deterministic.

use std::collections::{HashMap, VecDeque};
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bisync_bus::{Crc16, Transport};

const EOT: u8 = 0x04;
const ENQ: u8 = 0x05;
const NAK: u8 = 0x15;
const DLE: u8 = 0x10;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK0: u8 = 0x30;
const ACK1: u8 = 0x31;

#[derive(Default)]
struct Station {
    respond_to_select: bool,
    corrupt_next: bool,
    corrupt_all: bool,
    nak_data: u32,
    /// Payloads waiting to be offered when the master polls.
    backlog: VecDeque<Vec<u8>>,
    /// The payload currently offered and not yet acknowledged.
    pending: Option<Vec<u8>>,
    stats: StationStats,
}

/// Counters and captures accumulated by one simulated station.
#[derive(Default, Clone)]
pub struct StationStats {
    pub selects: u32,
    pub polls: u32,
    pub naks: u32,
    /// The significant byte of every acknowledgment the master sent.
    pub acks: Vec<u8>,
    /// Unstuffed payloads of accepted master data frames.
    pub received: Vec<Vec<u8>>,
    /// Raw wire bytes of every master data frame, accepted or not.
    pub raw_frames: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Sim {
    stations: HashMap<u8, Station>,
    /// Bytes queued for the master to read.
    rx: VecDeque<u8>,
    /// The station addressed by the latest select or poll request.
    current: Option<u8>,
    fail_open: bool,
}

impl Sim {
    fn on_frame(&mut self, frame: &[u8]) {
        match frame.first() {
            Some(&EOT) if frame.len() >= 4 && frame[3] == ENQ => self.on_request(frame[1]),
            Some(&DLE) if frame.get(1) == Some(&STX) => self.on_data(frame),
            Some(&DLE) => {
                if let Some(ack) = frame.get(1).copied() {
                    self.on_ack(ack);
                }
            }
            Some(&NAK) => self.on_nak(),
            _ => {}
        }
    }

    fn on_request(&mut self, header: u8) {
        let address = header & 0x0F;
        self.current = Some(address);
        let station = match self.stations.get_mut(&address) {
            Some(station) => station,
            // Nobody home: no reply, the master times out.
            None => return,
        };
        if header & 0xC0 == 0x80 {
            station.stats.selects += 1;
            if station.respond_to_select {
                self.rx.extend([DLE, ACK0]);
            }
        } else {
            station.stats.polls += 1;
            if station.pending.is_none() {
                station.pending = station.backlog.pop_front();
            }
            match station.pending.clone() {
                Some(payload) => {
                    let corrupt = station.corrupt_all || station.corrupt_next;
                    station.corrupt_next = false;
                    let frame = build_data_frame(&payload, corrupt);
                    self.rx.extend(frame);
                }
                None => self.rx.push_back(EOT),
            }
        }
    }

    fn on_data(&mut self, frame: &[u8]) {
        let station = match self.current.and_then(|a| self.stations.get_mut(&a)) {
            Some(station) => station,
            None => return,
        };
        station.stats.raw_frames.push(frame.to_vec());
        if station.nak_data > 0 {
            station.nak_data -= 1;
            self.rx.push_back(NAK);
            return;
        }
        if let Some(payload) = unstuff_and_check(frame) {
            station.stats.received.push(payload);
            self.rx.extend([DLE, ACK1]);
        } else {
            self.rx.push_back(NAK);
        }
    }

    fn on_ack(&mut self, ack: u8) {
        let station = match self.current.and_then(|a| self.stations.get_mut(&a)) {
            Some(station) => station,
            None => return,
        };
        station.stats.acks.push(ack);
        // The master keeps listening after an acknowledgment; offer the
        // next payload or end the transfer.
        station.pending = station.backlog.pop_front();
        match station.pending.clone() {
            Some(payload) => {
                let corrupt = station.corrupt_all || station.corrupt_next;
                station.corrupt_next = false;
                let frame = build_data_frame(&payload, corrupt);
                self.rx.extend(frame);
            }
            None => self.rx.push_back(EOT),
        }
    }

    fn on_nak(&mut self) {
        if let Some(station) = self.current.and_then(|a| self.stations.get_mut(&a)) {
            station.stats.naks += 1;
            // The retransmit happens on the re-poll that follows.
        }
    }
}

/// `DLE STX <stuffed> DLE ETX crc-hi crc-lo`, optionally with a flipped
/// checksum bit.
fn build_data_frame(payload: &[u8], corrupt: bool) -> Vec<u8> {
    let mut frame = vec![DLE, STX];
    for byte in payload {
        if *byte == DLE {
            frame.push(DLE);
        }
        frame.push(*byte);
    }
    frame.push(DLE);
    frame.push(ETX);
    let mut crc = Crc16::new();
    crc.init();
    crc.update_slice(payload);
    crc.update(ETX);
    let mut sum = crc.end();
    if corrupt {
        sum ^= 0x0001;
    }
    frame.push((sum >> 8) as u8);
    frame.push((sum & 0xFF) as u8);
    frame
}

/// Undo DLE stuffing and verify the checksum of a master data frame.
/// Returns the payload, or `None` on a checksum mismatch.
fn unstuff_and_check(frame: &[u8]) -> Option<Vec<u8>> {
    let mut payload = Vec::new();
    let mut rest = &frame[2..];
    let (terminator, crc) = loop {
        match rest {
            [DLE, DLE, tail @ ..] => {
                payload.push(DLE);
                rest = tail;
            }
            [DLE, term, hi, lo, ..] => break (*term, u16::from(*hi) << 8 | u16::from(*lo)),
            [byte, tail @ ..] => {
                payload.push(*byte);
                rest = tail;
            }
            [] => return None,
        }
    };
    let mut check = Crc16::new();
    check.init();
    check.update_slice(&payload);
    check.update(terminator);
    if check.end() == crc {
        Some(payload)
    } else {
        None
    }
}

/// The test body's view of the simulated link.
#[derive(Clone)]
pub struct SimHandle {
    sim: Arc<Mutex<Sim>>,
}

#[allow(dead_code)]
impl SimHandle {
    /// Register a station that acknowledges select requests.
    pub fn add_station(&self, address: u8) {
        let mut sim = self.sim.lock().unwrap();
        sim.stations.insert(
            address,
            Station {
                respond_to_select: true,
                ..Station::default()
            },
        );
    }

    pub fn set_respond_to_select(&self, address: u8, respond: bool) {
        self.station(address, |s| s.respond_to_select = respond);
    }

    /// Corrupt the checksum of the next data frame this station offers.
    pub fn corrupt_next(&self, address: u8) {
        self.station(address, |s| s.corrupt_next = true);
    }

    /// Corrupt the checksum of every data frame this station offers.
    pub fn set_corrupt_all(&self, address: u8, corrupt: bool) {
        self.station(address, |s| s.corrupt_all = corrupt);
    }

    /// Reject the next `count` master data frames with NAK.
    pub fn set_nak_data(&self, address: u8, count: u32) {
        self.station(address, |s| s.nak_data = count);
    }

    /// Queue a payload the station offers on its next poll.
    pub fn queue_tx(&self, address: u8, payload: &[u8]) {
        self.station(address, |s| s.backlog.push_back(payload.to_vec()));
    }

    pub fn stats(&self, address: u8) -> StationStats {
        let sim = self.sim.lock().unwrap();
        sim.stations
            .get(&address)
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.sim.lock().unwrap().fail_open = fail;
    }

    fn station(&self, address: u8, f: impl FnOnce(&mut Station)) {
        let mut sim = self.sim.lock().unwrap();
        if let Some(station) = sim.stations.get_mut(&address) {
            f(station);
        }
    }
}

/// The bus side of the simulated link.
pub struct SimLink {
    sim: Arc<Mutex<Sim>>,
}

impl Transport for SimLink {
    fn open(&mut self) -> std::io::Result<()> {
        if self.sim.lock().unwrap().fail_open {
            return Err(Error::new(ErrorKind::NotFound, "no such port"));
        }
        Ok(())
    }

    fn close(&mut self) {}

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.sim.lock().unwrap().on_frame(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let mut count = self.drain(buf);
        if count == 0 {
            thread::sleep(timeout.min(Duration::from_millis(2)));
            count = self.drain(buf);
        }
        Ok(count)
    }
}

impl SimLink {
    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let mut sim = self.sim.lock().unwrap();
        let mut count = 0;
        while count < buf.len() {
            match sim.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

pub fn sim_pair() -> (SimHandle, SimLink) {
    let sim = Arc::new(Mutex::new(Sim::default()));
    (
        SimHandle {
            sim: Arc::clone(&sim),
        },
        SimLink { sim },
    )
}

/// Poll `probe` until it returns true or a second passes.
#[allow(dead_code)]
pub fn wait_until(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
