//! Communication multiplexer.
//!
//! A bootloader may listen on several transports at once. The host that
//! talks first wins: replies go to the transport that delivered the most
//! recent packet. Before any packet arrived, replies go to all of them.

use log::{debug, warn};

use crate::error::Result;
use crate::protocol::{Packet, PacketTransport, TransportKind};

/// Set of transports polled together.
///
/// Transports are boxed, so this needs a heap. Targets without one poll
/// their transports directly; everything below this layer is allocation
/// free.
#[derive(Default)]
pub struct Com {
    transports: Vec<Box<dyn PacketTransport>>,
    active: Option<usize>,
    next: usize,
}

impl Com {
    /// Multiplexer without transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport.
    #[must_use]
    pub fn with_transport(mut self, transport: impl PacketTransport + 'static) -> Self {
        self.add(Box::new(transport));
        self
    }

    /// Add a boxed transport.
    pub fn add(&mut self, transport: Box<dyn PacketTransport>) {
        debug!("Adding {} transport", transport.kind());
        self.transports.push(transport);
    }

    /// Number of transports.
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    /// Whether no transport was added.
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Transport that delivered the most recent packet.
    pub fn active(&self) -> Option<TransportKind> {
        self.active.map(|i| self.transports[i].kind())
    }

    /// Poll the transports once each, starting after the one polled last,
    /// and return the first packet delivered.
    pub fn poll(&mut self) -> Option<(TransportKind, Packet)> {
        let count = self.transports.len();
        for step in 0..count {
            let index = (self.next + step) % count;
            if let Some(packet) = self.transports[index].receive_packet() {
                let kind = self.transports[index].kind();
                if self.active != Some(index) {
                    debug!("{kind} is now the active transport");
                }
                self.active = Some(index);
                self.next = (index + 1) % count;
                return Some((kind, packet));
            }
        }
        None
    }

    /// Send `data` on the active transport, or on every transport while none
    /// is active.
    ///
    /// When broadcasting, all transports are tried and the first error is
    /// returned.
    pub fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        if let Some(index) = self.active {
            return self.transports[index].transmit_packet(data);
        }

        let mut first_error = None;
        for transport in &mut self.transports {
            if let Err(e) = transport.transmit_packet(data) {
                warn!("Transmit on {} failed: {e}", transport.kind());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forget the active transport.
    pub fn reset(&mut self) {
        self.active = None;
    }
}
