//! Wired bus endpoint
//!
//! Owns the central node's side of the half-duplex bus: collision
//! avoidance before sending, per-destination message counters, request/
//! response correlation with retries, acknowledgements and the receive loop.
//!
//! A response belongs to the outstanding request when it comes from the
//! addressed peer, arrived after the request was sent and echoes the
//! request's sender counter as its receiver counter.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::BusTimings;
use crate::core::packet::{BusPacket, PacketKind, BROADCAST};
use crate::core::store::{BlockSource, BLOCK_SIZE};
use crate::core::transport::{BusTransport, TransportError, TransportStats};
use crate::error::{Result, WiredError};

const READ_EEPROM: u8 = 0x52;
const WRITE_EEPROM: u8 = 0x57;
const LOCK_BUS: u8 = 0x7A;
const UNLOCK_BUS: u8 = 0x5A;

/// Largest block write the devices accept
pub const MAX_WRITE_LEN: usize = 32;

/// Counter key for broadcast traffic
const BROADCAST_COUNTER: u32 = 0;

const EVENT_CAPACITY: usize = 256;

struct BusInner {
    transport: Arc<dyn BusTransport>,
    central_address: u32,
    timings: BusTimings,
    counters: DashMap<u32, u8>,
    /// Last frame sent to each destination
    last_sent: DashMap<u32, Instant>,
    /// Last frame received from each sender
    received: DashMap<u32, BusPacket>,
    unreachable: DashSet<u32>,
    /// Last frame in either direction from anybody
    bus_activity: Mutex<Option<Instant>>,
    /// Destination and counter of the request waiting for its response
    pending: Mutex<Option<(u32, u8)>>,
    request_lock: tokio::sync::Mutex<()>,
    disposing: AtomicBool,
    cancel: CancellationToken,
    events: broadcast::Sender<BusPacket>,
}

/// Central node's endpoint on one bus
pub struct WiredBus {
    inner: Arc<BusInner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WiredBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredBus")
            .field("transport", &self.inner.transport.name())
            .field("central_address", &format_args!("0x{:08X}", self.inner.central_address))
            .field("running", &self.receiver.lock().is_some())
            .finish()
    }
}

impl WiredBus {
    pub fn new(transport: Arc<dyn BusTransport>, central_address: u32, timings: BusTimings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                transport,
                central_address,
                timings,
                counters: DashMap::new(),
                last_sent: DashMap::new(),
                received: DashMap::new(),
                unreachable: DashSet::new(),
                bus_activity: Mutex::new(None),
                pending: Mutex::new(None),
                request_lock: tokio::sync::Mutex::new(()),
                disposing: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                events,
            }),
            receiver: Mutex::new(None),
        }
    }

    pub fn central_address(&self) -> u32 {
        self.inner.central_address
    }

    /// Spawn the receive loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut receiver = self.receiver.lock();
        if receiver.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *receiver = Some(tokio::spawn(async move { inner.receive_loop().await }));
        info!(
            "Wired bus endpoint 0x{:08X} listening on {}",
            self.inner.central_address,
            self.inner.transport.name()
        );
    }

    /// Stop the receive loop and reject further sends
    pub async fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Receive loop ended abnormally: {}", e);
            }
        }
        info!("Wired bus endpoint 0x{:08X} stopped", self.inner.central_address);
    }

    pub fn is_disposing(&self) -> bool {
        self.inner.disposing.load(Ordering::SeqCst)
    }

    /// Unsolicited information messages addressed to this node
    pub fn subscribe(&self) -> broadcast::Receiver<BusPacket> {
        self.inner.events.subscribe()
    }

    pub fn is_unreachable(&self, address: u32) -> bool {
        self.inner.unreachable.contains(&address)
    }

    pub fn clear_unreachable(&self, address: u32) {
        self.inner.unreachable.remove(&address);
    }

    pub async fn stats(&self) -> TransportStats {
        self.inner.transport.stats().await
    }

    /// Send `payload` to `destination` and wait for the correlated response.
    ///
    /// The response is an ACK or an information message; the latter is
    /// acknowledged before returning.
    pub async fn request(&self, destination: u32, payload: Vec<u8>) -> Result<BusPacket> {
        self.ensure_running()?;
        let _exchange = self.inner.request_lock.lock().await;

        let mut packet = BusPacket::message(self.inner.central_address, destination, payload);
        packet.sender_counter = self.inner.next_counter(destination);

        *self.inner.pending.lock() = Some((destination, packet.sender_counter));
        let result = self.inner.exchange(&packet).await;
        *self.inner.pending.lock() = None;

        let response = result?;
        if !response.is_ack() {
            let ack = BusPacket::ack(
                self.inner.central_address,
                destination,
                response.sender_counter,
            );
            self.inner.transmit(&ack).await?;
        }
        Ok(response)
    }

    /// Send a frame without waiting for anything
    pub async fn send_unacknowledged(&self, packet: &BusPacket) -> Result<()> {
        self.ensure_running()?;
        self.inner
            .collision_wait(packet.destination, packet.kind == PacketKind::Discovery)
            .await;
        self.inner.transmit(packet).await
    }

    /// Read one 16-byte configuration block
    pub async fn read_block(&self, destination: u32, address: u32) -> Result<Vec<u8>> {
        let [_, _, hi, lo] = address.to_be_bytes();
        let response = self
            .request(destination, vec![READ_EEPROM, hi, lo, BLOCK_SIZE as u8])
            .await?;
        if response.is_ack() || response.payload.len() != BLOCK_SIZE as usize {
            warn!(
                "Block read 0x{:04X} from 0x{:08X} returned {} bytes",
                address,
                destination,
                response.payload.len()
            );
            return Err(WiredError::MalformedResponse {
                address: destination,
                reason: format!(
                    "expected {} bytes for block 0x{:04X}, got {}",
                    BLOCK_SIZE,
                    address,
                    response.payload.len()
                ),
            });
        }
        trace!("Block 0x{:04X} of 0x{:08X}: {:02X?}", address, destination, response.payload);
        Ok(response.payload)
    }

    pub async fn write_block(&self, destination: u32, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > MAX_WRITE_LEN {
            return Err(WiredError::RequestTooLarge {
                len: data.len(),
                max: MAX_WRITE_LEN,
            });
        }
        let [_, _, hi, lo] = address.to_be_bytes();
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&[WRITE_EEPROM, hi, lo, data.len() as u8]);
        payload.extend_from_slice(data);
        self.request(destination, payload).await?;
        debug!("Wrote {} bytes at 0x{:04X} of 0x{:08X}", data.len(), address, destination);
        Ok(())
    }

    /// Keep other nodes quiet during a multi-step transaction
    pub async fn lock_bus(&self) -> Result<()> {
        self.bus_control(LOCK_BUS).await
    }

    pub async fn unlock_bus(&self) -> Result<()> {
        tokio::time::sleep(self.inner.timings.unlock_delay()).await;
        self.bus_control(UNLOCK_BUS).await
    }

    /// Control frames only latch when asserted twice
    async fn bus_control(&self, command: u8) -> Result<()> {
        for _ in 0..2 {
            let mut packet = BusPacket::system(vec![command]);
            packet.sender = self.inner.central_address;
            packet.sender_counter = self.inner.next_counter(BROADCAST_COUNTER);
            self.send_unacknowledged(&packet).await?;
            tokio::time::sleep(self.inner.timings.lock_settle()).await;
        }
        debug!("Bus control 0x{:02X} sent", command);
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_disposing() {
            return Err(WiredError::Disposing);
        }
        Ok(())
    }
}

impl BusInner {
    /// Current counter for `destination`; the stored one moves on
    fn next_counter(&self, destination: u32) -> u8 {
        let key = if destination == BROADCAST {
            BROADCAST_COUNTER
        } else {
            destination
        };
        let mut counter = self.counters.entry(key).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x03;
        current
    }

    fn mark_activity(&self) {
        *self.bus_activity.lock() = Some(Instant::now());
    }

    fn bus_busy(&self) -> bool {
        self.bus_activity
            .lock()
            .map(|at| at.elapsed() < self.timings.min_gap())
            .unwrap_or(false)
    }

    /// Wait for a quiet bus unless this is a continuation of a running exchange
    async fn collision_wait(&self, destination: u32, discovery: bool) {
        if discovery {
            return;
        }
        let recently_sent = self
            .last_sent
            .get(&destination)
            .map(|at| at.elapsed() <= self.timings.min_gap())
            .unwrap_or(false);
        if recently_sent {
            return;
        }
        let recently_heard = self
            .received
            .get(&destination)
            .and_then(|p| p.time_received)
            .map(|at| at.elapsed() <= self.timings.rx_window())
            .unwrap_or(false);
        if recently_heard {
            return;
        }

        if self.bus_busy() {
            trace!("Waiting for the bus to become free before 0x{:08X}", destination);
        }
        while self.bus_busy() {
            tokio::time::sleep(self.timings.busy_poll()).await;
            if !self.bus_busy() {
                let backoff = rand::thread_rng().gen_range(0..=self.timings.backoff_max_ms);
                trace!("Bus free, backing off {} ms", backoff);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
    }

    /// A reply to the peer's own frame waits out the device's turnaround
    async fn response_delay(&self, destination: u32) {
        let delay = self.timings.response_delay();
        let since = self
            .received
            .get(&destination)
            .and_then(|p| p.time_received)
            .map(|at| at.elapsed());
        if let Some(since) = since {
            if since < delay {
                tokio::time::sleep(delay - since).await;
            }
        }
    }

    async fn transmit(&self, packet: &BusPacket) -> Result<()> {
        if let Err(e) = self.transport.send(packet).await {
            warn!("Send to 0x{:08X} failed: {}", packet.destination, e);
            return Err(e.into());
        }
        self.last_sent.insert(packet.destination, Instant::now());
        self.mark_activity();
        Ok(())
    }

    fn correlated(&self, destination: u32, sent_at: Instant, counter: u8) -> Option<BusPacket> {
        let response = self.received.get(&destination)?;
        let fresh = response.time_received.map(|t| t >= sent_at).unwrap_or(false);
        (fresh && response.receiver_counter == counter).then(|| response.clone())
    }

    async fn exchange(&self, packet: &BusPacket) -> Result<BusPacket> {
        let destination = packet.destination;
        self.collision_wait(destination, false).await;
        self.response_delay(destination).await;

        for attempt in 1..=self.timings.attempts {
            let sent_at = Instant::now();
            self.transmit(packet).await?;
            for slice in self.timings.poll_schedule() {
                tokio::time::sleep(slice).await;
                if let Some(response) = self.correlated(destination, sent_at, packet.sender_counter) {
                    return Ok(response);
                }
            }
            debug!(
                "No response from 0x{:08X} (attempt {}/{})",
                destination, attempt, self.timings.attempts
            );
        }

        self.unreachable.insert(destination);
        warn!("Device 0x{:08X} unreachable", destination);
        Err(WiredError::Unreachable {
            address: destination,
        })
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.receive() => match result {
                    Ok(packet) => self.on_packet(packet).await,
                    Err(TransportError::Closed) => {
                        warn!("Transport {} closed", self.transport.name());
                        break;
                    },
                    Err(e) => warn!("Dropping inbound frame: {}", e),
                },
            }
        }
        debug!("Receive loop finished");
    }

    async fn on_packet(&self, mut packet: BusPacket) {
        packet.time_received = Some(Instant::now());
        self.mark_activity();

        if packet.destination != self.central_address && packet.destination != BROADCAST {
            return;
        }
        let sender = packet.sender;
        trace!(
            "Frame from 0x{:08X}: {:?} {:02X?}",
            sender,
            packet.kind,
            packet.payload
        );
        if self.unreachable.remove(&sender).is_some() {
            info!("Device 0x{:08X} reachable again", sender);
        }
        self.received.insert(sender, packet.clone());

        if packet.kind != PacketKind::Message {
            return;
        }
        let answers_request = *self.pending.lock() == Some((sender, packet.receiver_counter));
        if answers_request {
            return;
        }

        if packet.ack_required && packet.destination == self.central_address {
            tokio::time::sleep(self.timings.response_delay()).await;
            let ack = BusPacket::ack(self.central_address, sender, packet.sender_counter);
            if let Err(e) = self.transmit(&ack).await {
                warn!("Cannot acknowledge 0x{:08X}: {}", sender, e);
            }
        }
        // nobody listening is fine
        let _ = self.events.send(packet);
    }
}

/// Configuration blocks of one peer, fetched and stored over the bus
pub struct BusBlockSource {
    bus: Arc<WiredBus>,
    peer_address: u32,
}

impl BusBlockSource {
    pub fn new(bus: Arc<WiredBus>, peer_address: u32) -> Self {
        Self { bus, peer_address }
    }
}

#[async_trait]
impl BlockSource for BusBlockSource {
    async fn fetch_block(&self, address: u32) -> Result<Vec<u8>> {
        self.bus.read_block(self.peer_address, address).await
    }

    async fn store_block(&self, address: u32, data: &[u8]) -> Result<()> {
        self.bus.write_block(self.peer_address, address, data).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::transport::MockBus;

    const CENTRAL: u32 = 0x0000_0001;

    #[test]
    fn test_counters_wrap_per_destination() {
        let bus = WiredBus::new(Arc::new(MockBus::new()), CENTRAL, BusTimings::fast());
        let counters: Vec<u8> = (0..5).map(|_| bus.inner.next_counter(0x42)).collect();
        assert_eq!(counters, vec![0, 1, 2, 3, 0]);
        assert_eq!(bus.inner.next_counter(0x43), 0);
        assert_eq!(bus.inner.next_counter(BROADCAST), 0);
        assert_eq!(bus.inner.next_counter(BROADCAST), 1);
    }

    #[tokio::test]
    async fn test_quiet_bus_sends_immediately() {
        let timings = BusTimings {
            backoff_max_ms: 0,
            ..BusTimings::default()
        };
        let bus = WiredBus::new(Arc::new(MockBus::new()), CENTRAL, timings);
        let started = Instant::now();
        bus.inner.collision_wait(0x42, false).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_busy_bus_waits_for_gap() {
        let timings = BusTimings {
            min_gap_ms: 60,
            busy_poll_ms: 10,
            backoff_max_ms: 0,
            ..BusTimings::default()
        };
        let bus = WiredBus::new(Arc::new(MockBus::new()), CENTRAL, timings);
        let started = Instant::now();
        bus.inner.mark_activity();
        bus.inner.collision_wait(0x42, false).await;
        assert!(started.elapsed() >= Duration::from_millis(60));

        // discovery probes never wait
        bus.inner.mark_activity();
        let started = Instant::now();
        bus.inner.collision_wait(0x42, true).await;
        assert!(started.elapsed() < Duration::from_millis(60));
    }
}
