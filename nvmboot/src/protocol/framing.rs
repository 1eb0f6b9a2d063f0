//! Length-prefixed packet framing.
//!
//! Used by the simple byte-stream transports (RS-232, buffered USB bulk):
//!
//! ```text
//! +--------+------------------------+-------------+
//! | len    | payload (len bytes)    | [checksum]  |
//! | 1..max |                        | optional    |
//! +--------+------------------------+-------------+
//! ```
//!
//! Reception is polled, one byte per call. A silence of `rx_timeout_ms`
//! since the previous byte abandons the partial packet; there is no
//! resumption, the host retransmits the whole packet.

use log::{debug, trace};

use crate::config::{FrameChecksum, FramingConfig};
use crate::error::{Error, Result};
use crate::hal::{ByteChannel, Clock, NoWatchdog, Watchdog};
use crate::poll::poll_until;
use crate::protocol::packet::{MAX_PACKET_LEN, Packet, check_len};
use crate::protocol::{PacketTransport, TransportKind};

/// Reception progress of one framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceptionState {
    Idle,
    Receiving {
        /// Bytes expected after the length byte, checksum included.
        expected: usize,
        count: usize,
        first_byte_ms: u32,
        last_byte_ms: u32,
    },
}

/// Packet framer over a [`ByteChannel`].
pub struct PacketFramer<Ch, Cl, W = NoWatchdog> {
    channel: Ch,
    clock: Cl,
    watchdog: W,
    config: FramingConfig,
    kind: TransportKind,
    state: ReceptionState,
    buffer: [u8; MAX_PACKET_LEN + 1],
}

impl<Ch, Cl, W> PacketFramer<Ch, Cl, W>
where
    Ch: ByteChannel,
    Cl: Clock,
    W: Watchdog,
{
    /// Create a framer. The configuration is validated here.
    pub fn new(channel: Ch, clock: Cl, watchdog: W, config: FramingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            channel,
            clock,
            watchdog,
            config,
            kind: TransportKind::Rs232,
            state: ReceptionState::Idle,
            buffer: [0u8; MAX_PACKET_LEN + 1],
        })
    }

    /// Set the transport kind reported to the com layer.
    #[must_use]
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Whether a packet is partially received.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ReceptionState::Receiving { .. })
    }

    /// Borrow the underlying channel.
    pub fn channel(&self) -> &Ch {
        &self.channel
    }

    /// Mutably borrow the underlying channel.
    pub fn channel_mut(&mut self) -> &mut Ch {
        &mut self.channel
    }

    /// Consume the framer and return the channel.
    pub fn into_channel(self) -> Ch {
        self.channel
    }

    /// Send `data` as one packet.
    ///
    /// Fails with [`Error::PacketLength`] for empty or oversized payloads and
    /// with [`Error::Timeout`] when the channel does not take a byte in time.
    pub fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        check_len(data.len(), usize::from(self.config.max_tx_data))?;
        #[allow(clippy::cast_possible_truncation)] // at most max_tx_data
        let len = data.len() as u8;

        trace!("tx packet {len} bytes: {data:02X?}");
        self.transmit_byte(len)?;
        for &byte in data {
            self.transmit_byte(byte)?;
        }
        if self.config.checksum == FrameChecksum::ByteSum {
            self.transmit_byte(byte_sum(len, data))?;
        }
        Ok(())
    }

    /// Poll for one byte and return a packet once it is complete.
    ///
    /// Never blocks. Invalid length bytes, timed-out partial packets and
    /// checksum mismatches are dropped silently.
    pub fn receive_packet(&mut self) -> Option<Packet> {
        let byte = match self.state {
            ReceptionState::Idle => {
                let byte = self.channel.receive_byte()?;
                self.start_packet(byte);
                return None;
            },
            ReceptionState::Receiving { last_byte_ms, .. } => {
                let now = self.clock.millis();
                let timed_out = now.wrapping_sub(last_byte_ms) >= self.config.rx_timeout_ms;
                match self.channel.receive_byte() {
                    Some(byte) if timed_out => {
                        self.abandon();
                        self.start_packet(byte);
                        return None;
                    },
                    Some(byte) => byte,
                    None => {
                        if timed_out {
                            self.abandon();
                        }
                        return None;
                    },
                }
            },
        };

        let ReceptionState::Receiving {
            expected,
            count,
            first_byte_ms,
            ..
        } = self.state
        else {
            return None;
        };

        let now = self.clock.millis();
        self.buffer[count] = byte;
        let count = count + 1;
        if count < expected {
            self.state = ReceptionState::Receiving {
                expected,
                count,
                first_byte_ms,
                last_byte_ms: now,
            };
            return None;
        }

        self.state = ReceptionState::Idle;
        let payload_len = expected - self.config.checksum.len();
        let payload = &self.buffer[..payload_len];
        if self.config.checksum == FrameChecksum::ByteSum {
            #[allow(clippy::cast_possible_truncation)] // at most 255
            let sum = byte_sum(payload_len as u8, payload);
            if sum != self.buffer[payload_len] {
                debug!("Dropping packet with bad checksum {:#04x}", self.buffer[payload_len]);
                return None;
            }
        }
        trace!(
            "rx packet {payload_len} bytes in {} ms",
            now.wrapping_sub(first_byte_ms)
        );
        Packet::new(payload).ok()
    }

    fn start_packet(&mut self, len: u8) {
        if len == 0 || len > self.config.max_rx_data {
            trace!("Ignoring invalid length byte {len}");
            return;
        }
        let now = self.clock.millis();
        self.state = ReceptionState::Receiving {
            expected: usize::from(len) + self.config.checksum.len(),
            count: 0,
            first_byte_ms: now,
            last_byte_ms: now,
        };
    }

    fn abandon(&mut self) {
        if let ReceptionState::Receiving {
            expected, count, ..
        } = self.state
        {
            debug!("Packet reception timed out after {count}/{expected} bytes");
        }
        self.state = ReceptionState::Idle;
    }

    fn transmit_byte(&mut self, byte: u8) -> Result<()> {
        let channel = &mut self.channel;
        let timeout = self.config.byte_tx_timeout_ms;
        if poll_until(&self.clock, &self.watchdog, timeout, || channel.write_byte(byte)) {
            Ok(())
        } else {
            Err(Error::Timeout(format!(
                "transmitter did not accept a byte within {timeout} ms"
            )))
        }
    }
}

impl<Ch, Cl, W> PacketTransport for PacketFramer<Ch, Cl, W>
where
    Ch: ByteChannel,
    Cl: Clock,
    W: Watchdog,
{
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        PacketFramer::transmit_packet(self, data)
    }

    fn receive_packet(&mut self) -> Option<Packet> {
        PacketFramer::receive_packet(self)
    }
}

fn byte_sum(len: u8, data: &[u8]) -> u8 {
    data.iter().fold(len, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{CountingWatchdog, MockChannel, MockClock};

    fn framer<'a>(
        input: &[u8],
        clock: &'a MockClock,
        config: FramingConfig,
    ) -> PacketFramer<MockChannel, &'a MockClock> {
        PacketFramer::new(MockChannel::with_input(input), clock, NoWatchdog, config).unwrap()
    }

    fn poll(framer: &mut PacketFramer<MockChannel, &MockClock>, times: usize) -> Vec<Packet> {
        (0..times).filter_map(|_| framer.receive_packet()).collect()
    }

    #[test]
    fn test_receive_delivers_once() {
        let clock = MockClock::default();
        let mut f = framer(&[3, 0xAA, 0xBB, 0xCC], &clock, FramingConfig::default());

        let packets = poll(&mut f, 10);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), &[0xAA, 0xBB, 0xCC]);
        assert!(!f.is_receiving());
    }

    #[test]
    fn test_invalid_length_bytes_ignored() {
        let clock = MockClock::default();
        let config = FramingConfig::default().with_max_data(8, 8);
        // 0 and 9 are not frame starts; 1 is.
        let mut f = framer(&[0, 9, 1, 0x42], &clock, config);
        let packets = poll(&mut f, 10);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), &[0x42]);
    }

    #[test]
    fn test_gap_abandons_packet_and_retransmission_succeeds() {
        let clock = MockClock::default();
        let mut f = framer(&[3, 1, 2], &clock, FramingConfig::default());
        assert!(poll(&mut f, 3).is_empty());
        assert!(f.is_receiving());

        clock.advance_ms(100);
        // The late byte starts the retransmitted packet.
        f.channel_mut().feed(&[3, 1, 2, 3]);
        let packets = poll(&mut f, 10);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_timeout_without_traffic_returns_to_idle() {
        let clock = MockClock::default();
        let mut f = framer(&[5, 1], &clock, FramingConfig::default());
        poll(&mut f, 2);
        clock.advance_ms(99);
        poll(&mut f, 1);
        assert!(f.is_receiving());
        clock.advance_ms(1);
        poll(&mut f, 1);
        assert!(!f.is_receiving());
    }

    #[test]
    fn test_slow_but_steady_stream_completes() {
        let clock = MockClock::default();
        let mut f = framer(&[], &clock, FramingConfig::default());
        let mut got = Vec::new();
        for byte in [4u8, 1, 2, 3, 4] {
            clock.advance_ms(90);
            f.channel_mut().feed(&[byte]);
            got.extend(f.receive_packet());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_transmit_writes_length_then_payload() {
        let clock = MockClock::default();
        let mut f = framer(&[], &clock, FramingConfig::default());
        f.transmit_packet(&[0x10, 0x20]).unwrap();
        assert_eq!(f.channel().tx, vec![2, 0x10, 0x20]);
    }

    #[test]
    fn test_transmit_rejects_bad_length() {
        let clock = MockClock::default();
        let mut f = framer(&[], &clock, FramingConfig::default().with_max_data(8, 4));
        assert!(matches!(
            f.transmit_packet(&[0; 5]),
            Err(Error::PacketLength { len: 5, max: 4 })
        ));
        assert!(f.transmit_packet(&[]).is_err());
        assert!(f.channel().tx.is_empty());
    }

    #[test]
    fn test_transmit_times_out_and_services_watchdog() {
        let clock = MockClock::stepping(1, 0);
        let wd = CountingWatchdog::default();
        let mut channel = MockChannel::default();
        channel.tx_stuck = true;
        let mut f = PacketFramer::new(channel, &clock, &wd, FramingConfig::default()).unwrap();

        assert!(matches!(f.transmit_packet(&[1]), Err(Error::Timeout(_))));
        assert!(wd.count.get() > 1);
    }

    #[test]
    fn test_byte_sum_checksum() {
        let clock = MockClock::default();
        let config = FramingConfig::default().with_checksum(FrameChecksum::ByteSum);
        let mut tx = framer(&[], &clock, config);
        tx.transmit_packet(&[0x80, 0x90]).unwrap();
        let wire = tx.channel().tx.clone();
        assert_eq!(wire, vec![2, 0x80, 0x90, 0x12]);

        let mut rx = framer(&wire, &clock, config);
        let packets = poll(&mut rx, 10);
        assert_eq!(packets[0].payload(), &[0x80, 0x90]);

        let mut corrupted = wire;
        corrupted[3] ^= 1;
        let mut rx = framer(&corrupted, &clock, config);
        assert!(poll(&mut rx, 10).is_empty());
        assert!(!rx.is_receiving());
    }
}
