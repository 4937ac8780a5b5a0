//! Exercises one secondary station over a real serial port: cycles through
//! a few request commands, reads the replies, and prints per-second
//! throughput figures.
//!
//! Usage: `bus_tester <port> [station-address]`

use std::env;
use std::io::{self, Read as _, Write as _};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use serialport::SerialPort;

use bisync_bus::{Bus, PortSettings, Transport};

/// [`Transport`] over a [`serialport`] handle. The port is opened lazily
/// so the bus can be constructed before the device exists.
struct SerialLink {
    settings: PortSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    fn new(settings: PortSettings) -> SerialLink {
        SerialLink {
            settings,
            port: None,
        }
    }
}

impl Transport for SerialLink {
    fn open(&mut self) -> io::Result<()> {
        let port = serialport::new(&self.settings.path, self.settings.baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|err| io::Error::new(io::ErrorKind::NotFound, err))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.port.as_mut() {
            Some(port) => port.write_all(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        port.set_timeout(timeout.min(Duration::from_millis(50)))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        match port.read(buf) {
            Ok(len) => Ok(len),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().ok_or_else(|| anyhow!("usage: bus_tester <port> [station-address]"))?;
    let address: u8 = args.next().as_deref().unwrap_or("1").parse()?;

    let commands: [&[u8]; 4] = [
        b"\x00$i\r",
        b"\x01$0\r",
        b"\x00$IO\n",
        b"\x00$G\r\n",
    ];

    let link = SerialLink::new(PortSettings::new(&path));
    let mut bus = Bus::new(link, Duration::from_millis(500));
    bus.start().with_context(|| format!("cannot open {}", path))?;
    let node = bus
        .create_node_default(address)
        .context("station address")?;

    let mut reply = [0u8; 512];
    let mut sent = 0usize;
    let mut received = 0usize;
    let mut max_reply = 0usize;
    let mut worst_rtt = Duration::ZERO;
    let mut window = Instant::now();

    for command in commands.iter().cycle() {
        let rtt = Instant::now();
        node.send(command, Some(Duration::from_secs(1)))?;
        sent += command.len();

        let len = node.receive(&mut reply, Some(Duration::from_secs(2)))?;
        let rtt = rtt.elapsed();
        if len == 0 {
            eprintln!("reply timeout");
            continue;
        }

        received += len;
        max_reply = max_reply.max(len);
        worst_rtt = worst_rtt.max(rtt);

        if window.elapsed() >= Duration::from_secs(1) {
            println!(
                "recv {} B/s, send {} B/s, max reply {} B, worst rtt {} ms",
                received,
                sent,
                max_reply,
                worst_rtt.as_millis()
            );
            sent = 0;
            received = 0;
            max_reply = 0;
            worst_rtt = Duration::ZERO;
            window = Instant::now();
        }
    }
    unreachable!()
}
