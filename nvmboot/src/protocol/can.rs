//! CAN transport.
//!
//! One classic CAN data frame carries one packet; the DLC is the packet
//! length, so packets are limited to [`CAN_MAX_DLC`] bytes. The node listens
//! on a single receive identifier and answers on its own transmit
//! identifier:
//!
//! ```text
//! host  --[rx_msg_id, DLC n, n bytes]-->  node
//! host  <--[tx_msg_id, DLC n, n bytes]--  node
//! ```
//!
//! Messages with any other identifier are consumed and dropped.

use log::{debug, trace};

use crate::config::{CAN_MAX_EXT_ID, CAN_MAX_STD_ID, CanConfig};
use crate::error::{Error, Result};
use crate::hal::{CanChannel, Clock, NoWatchdog, Watchdog};
use crate::poll::poll_until;
use crate::protocol::packet::{Packet, check_len};
use crate::protocol::{PacketTransport, TransportKind};

/// Data bytes in one classic CAN frame.
pub const CAN_MAX_DLC: usize = 8;

/// One classic CAN data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; CAN_MAX_DLC],
}

impl CanFrame {
    /// Build a frame. Fails for more than [`CAN_MAX_DLC`] data bytes or an
    /// identifier wider than 11 (or, extended, 29) bits.
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        if data.len() > CAN_MAX_DLC {
            return Err(Error::PacketLength {
                len: data.len(),
                max: CAN_MAX_DLC,
            });
        }
        let max = if extended { CAN_MAX_EXT_ID } else { CAN_MAX_STD_ID };
        if id > max {
            return Err(Error::Config(format!("CAN id {id:#x} exceeds {max:#x}")));
        }
        let mut buf = [0u8; CAN_MAX_DLC];
        buf[..data.len()].copy_from_slice(data);
        #[allow(clippy::cast_possible_truncation)] // at most 8
        let len = data.len() as u8;
        Ok(Self {
            id,
            extended,
            len,
            data: buf,
        })
    }

    /// Message identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the identifier is 29 bits wide.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Data length code.
    pub fn dlc(&self) -> u8 {
        self.len
    }

    /// Data bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// Bit timing limits of a CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanPeripheral {
    /// Clock feeding the prescaler, in Hz.
    pub base_freq_hz: u32,
    /// Smallest supported prescaler.
    pub prescaler_min: u16,
    /// Largest supported prescaler.
    pub prescaler_max: u16,
    /// Smallest supported time segment 1.
    pub tseg1_min: u16,
    /// Largest supported time segment 1.
    pub tseg1_max: u16,
    /// Smallest supported time segment 2.
    pub tseg2_min: u16,
    /// Largest supported time segment 2.
    pub tseg2_max: u16,
}

/// Bit timing register values for one bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Clock prescaler.
    pub prescaler: u16,
    /// Time segment 1 in time quanta, sync segment excluded.
    pub tseg1: u16,
    /// Time segment 2 in time quanta.
    pub tseg2: u16,
    /// Synchronization jump width.
    pub sjw: u16,
}

impl BitTiming {
    /// Lowest sample point accepted, in percent of the bit time.
    pub const SAMPLE_POINT_MIN: u32 = 65;
    /// Highest sample point accepted, in percent of the bit time.
    pub const SAMPLE_POINT_MAX: u32 = 80;

    /// Find the smallest prescaler that divides the peripheral clock into a
    /// whole number of time quanta per bit, with the sample point in
    /// 65..=80 %.
    ///
    /// Returns `None` when `baudrate` cannot be reached exactly.
    pub fn calculate(baudrate: u32, periph: &CanPeripheral) -> Option<Self> {
        if !(10_000..=8_000_000).contains(&baudrate) {
            return None;
        }
        let base = periph.base_freq_hz;
        let bit_tq_min = 1 + u32::from(periph.tseg1_min) + u32::from(periph.tseg2_min);
        let bit_tq_max = 1 + u32::from(periph.tseg1_max) + u32::from(periph.tseg2_max);
        let tseg1_range = u32::from(periph.tseg1_min)..=u32::from(periph.tseg1_max);
        let tseg2_range = u32::from(periph.tseg2_min)..=u32::from(periph.tseg2_max);

        for prescaler in periph.prescaler_min.max(1)..=periph.prescaler_max {
            let scaled = base / u32::from(prescaler);
            if u64::from(scaled) < u64::from(baudrate) * u64::from(bit_tq_min) {
                break;
            }
            if base % u32::from(prescaler) != 0 || scaled % baudrate != 0 {
                continue;
            }

            let bit_tq = scaled / baudrate;
            if !(bit_tq_min..=bit_tq_max).contains(&bit_tq) {
                continue;
            }
            // Roughly 80 % sample point, then check what rounding left.
            let tseg2 = (bit_tq * 2).div_ceil(10);
            let Some(tseg1) = bit_tq.checked_sub(tseg2 + 1) else {
                continue;
            };
            if !tseg1_range.contains(&tseg1) || !tseg2_range.contains(&tseg2) {
                continue;
            }
            let sample_point = (1 + tseg1) * 100 / bit_tq;
            if !(Self::SAMPLE_POINT_MIN..=Self::SAMPLE_POINT_MAX).contains(&sample_point) {
                continue;
            }

            // Both segments are bounded by the u16 peripheral limits.
            #[allow(clippy::cast_possible_truncation)]
            let (tseg1, tseg2) = (tseg1 as u16, tseg2 as u16);
            return Some(Self {
                prescaler,
                tseg1,
                tseg2,
                sjw: (tseg2 / 2).max(1),
            });
        }
        None
    }
}

/// Packet transport over a [`CanChannel`].
pub struct CanTransport<Ch, Cl, W = NoWatchdog> {
    channel: Ch,
    clock: Cl,
    watchdog: W,
    config: CanConfig,
    dropped: u32,
}

impl<Ch, Cl, W> CanTransport<Ch, Cl, W>
where
    Ch: CanChannel,
    Cl: Clock,
    W: Watchdog,
{
    /// Create a CAN transport. The configuration is validated here.
    pub fn new(channel: Ch, clock: Cl, watchdog: W, config: CanConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            "CAN transport rx {:#x} tx {:#x} at {} bps",
            config.rx_msg_id, config.tx_msg_id, config.baudrate
        );
        Ok(Self {
            channel,
            clock,
            watchdog,
            config,
            dropped: 0,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// Messages consumed without yielding a packet.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Borrow the underlying channel.
    pub fn channel(&self) -> &Ch {
        &self.channel
    }

    /// Mutably borrow the underlying channel.
    pub fn channel_mut(&mut self) -> &mut Ch {
        &mut self.channel
    }

    /// Send `data` as one message on the transmit identifier.
    ///
    /// Waits at most `tx_timeout_ms` for a free mailbox and again for the
    /// acknowledge; either expiring yields [`Error::Timeout`].
    pub fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        check_len(data.len(), CAN_MAX_DLC)?;
        let frame = CanFrame::new(self.config.tx_msg_id, self.config.extended_id, data)?;
        trace!("tx CAN {:#x} {data:02X?}", frame.id());

        let timeout = self.config.tx_timeout_ms;
        let channel = &mut self.channel;
        if !poll_until(&self.clock, &self.watchdog, timeout, || {
            channel.transmit_message(&frame)
        }) {
            return Err(Error::Timeout(format!(
                "no CAN transmit mailbox free within {timeout} ms"
            )));
        }
        if !poll_until(&self.clock, &self.watchdog, timeout, || channel.is_tx_complete()) {
            return Err(Error::Timeout(format!(
                "CAN message {:#x} not acknowledged within {timeout} ms",
                frame.id()
            )));
        }
        Ok(())
    }

    /// Take one message off the controller and return it as a packet if it
    /// is addressed to this node. Never blocks.
    pub fn receive_packet(&mut self) -> Option<Packet> {
        let frame = self.channel.receive_message()?;
        if frame.id() != self.config.rx_msg_id || frame.is_extended() != self.config.extended_id
        {
            trace!("Ignoring CAN message {:#x}", frame.id());
            self.dropped += 1;
            return None;
        }
        if frame.dlc() == 0 {
            debug!("Dropping empty CAN message");
            self.dropped += 1;
            return None;
        }
        trace!("rx CAN packet {} bytes", frame.dlc());
        Packet::new(frame.data()).ok()
    }
}

impl<Ch, Cl, W> PacketTransport for CanTransport<Ch, Cl, W>
where
    Ch: CanChannel,
    Cl: Clock,
    W: Watchdog,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Can
    }

    fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        CanTransport::transmit_packet(self, data)
    }

    fn receive_packet(&mut self) -> Option<Packet> {
        CanTransport::receive_packet(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{CountingWatchdog, MockCan, MockClock};

    const RX: u32 = 0x667;
    const TX: u32 = 0x7E1;

    fn transport(clock: &MockClock) -> CanTransport<MockCan, &MockClock> {
        CanTransport::new(MockCan::default(), clock, NoWatchdog, CanConfig::default()).unwrap()
    }

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(id, false, data).unwrap()
    }

    #[test]
    fn test_receive_filters_on_rx_id() {
        let clock = MockClock::default();
        let mut can = transport(&clock);
        can.channel_mut().rx.extend([
            frame(0x123, &[1, 2]),
            frame(TX, &[3]),
            frame(RX, &[0xFF, 0x00, 0x10]),
        ]);

        assert!(can.receive_packet().is_none());
        assert!(can.receive_packet().is_none());
        let packet = can.receive_packet().unwrap();
        assert_eq!(packet.payload(), &[0xFF, 0x00, 0x10]);
        assert_eq!(can.dropped(), 2);
        assert!(can.receive_packet().is_none());
    }

    #[test]
    fn test_receive_drops_empty_and_wrong_id_width() {
        let clock = MockClock::default();
        let mut can = transport(&clock);
        can.channel_mut().rx.extend([
            frame(RX, &[]),
            CanFrame::new(RX, true, &[1]).unwrap(),
        ]);
        assert!(can.receive_packet().is_none());
        assert!(can.receive_packet().is_none());
        assert_eq!(can.dropped(), 2);
    }

    #[test]
    fn test_transmit_uses_tx_id_and_dlc() {
        let clock = MockClock::default();
        let mut can = transport(&clock);
        can.transmit_packet(&[0xFF, 0x01]).unwrap();

        let sent = &can.channel().tx;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), TX);
        assert_eq!(sent[0].dlc(), 2);
        assert_eq!(sent[0].data(), &[0xFF, 0x01]);
        assert!(!sent[0].is_extended());
    }

    #[test]
    fn test_transmit_rejects_bad_length() {
        let clock = MockClock::default();
        let mut can = transport(&clock);
        assert!(matches!(
            can.transmit_packet(&[0; 9]),
            Err(Error::PacketLength { len: 9, max: 8 })
        ));
        assert!(can.transmit_packet(&[]).is_err());
        assert!(can.channel().tx.is_empty());
    }

    #[test]
    fn test_busy_mailbox_times_out_and_services_watchdog() {
        let clock = MockClock::stepping(1, 0);
        let wd = CountingWatchdog::default();
        let channel = MockCan {
            mailbox_busy: true,
            ..MockCan::default()
        };
        let mut can = CanTransport::new(channel, &clock, &wd, CanConfig::default()).unwrap();

        assert!(matches!(can.transmit_packet(&[1]), Err(Error::Timeout(_))));
        assert!(wd.count.get() > 50);
    }

    #[test]
    fn test_missing_acknowledge_times_out() {
        let clock = MockClock::stepping(1, 0);
        let channel = MockCan {
            no_ack: true,
            ..MockCan::default()
        };
        let mut can =
            CanTransport::new(channel, &clock, NoWatchdog, CanConfig::default()).unwrap();
        let err = can.transmit_packet(&[1, 2]).unwrap_err();
        assert!(err.to_string().contains("not acknowledged"));
        assert_eq!(can.channel().tx.len(), 1);
    }

    #[test]
    fn test_extended_ids() {
        let clock = MockClock::default();
        let config = CanConfig::default()
            .with_ids(0x1800_0001, 0x1800_0002)
            .with_extended_id(true);
        let mut can = CanTransport::new(MockCan::default(), &clock, NoWatchdog, config).unwrap();
        can.channel_mut()
            .rx
            .push_back(CanFrame::new(0x1800_0002, true, &[7]).unwrap());
        assert_eq!(can.receive_packet().unwrap().payload(), &[7]);

        can.transmit_packet(&[8]).unwrap();
        assert!(can.channel().tx[0].is_extended());
        assert_eq!(can.channel().tx[0].id(), 0x1800_0001);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CanConfig::default().with_ids(0x800, 0x667);
        assert!(matches!(
            CanTransport::new(MockCan::default(), MockClock::default(), NoWatchdog, config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_frame_limits() {
        assert!(CanFrame::new(0x7FF, false, &[0; 8]).is_ok());
        assert!(CanFrame::new(0x800, false, &[]).is_err());
        assert!(CanFrame::new(0x800, true, &[]).is_ok());
        assert!(CanFrame::new(0x100, false, &[0; 9]).is_err());
    }

    const PERIPH: CanPeripheral = CanPeripheral {
        base_freq_hz: 8_000_000,
        prescaler_min: 1,
        prescaler_max: 512,
        tseg1_min: 1,
        tseg1_max: 256,
        tseg2_min: 1,
        tseg2_max: 128,
    };

    #[test]
    fn test_bit_timing_500k_on_8mhz() {
        let timing = BitTiming::calculate(500_000, &PERIPH).unwrap();
        assert_eq!(
            timing,
            BitTiming {
                prescaler: 1,
                tseg1: 11,
                tseg2: 4,
                sjw: 2,
            }
        );
    }

    #[test]
    fn test_bit_timing_picks_larger_prescaler_when_needed() {
        let narrow = CanPeripheral {
            tseg1_max: 16,
            tseg2_max: 8,
            ..PERIPH
        };
        // 80 quanta per bit at prescaler 1 do not fit, 20 at prescaler 4 do.
        let timing = BitTiming::calculate(100_000, &narrow).unwrap();
        assert_eq!(timing.prescaler, 4);
        assert_eq!(1 + timing.tseg1 + timing.tseg2, 20);
    }

    #[test]
    fn test_bit_timing_unreachable_rates() {
        assert!(BitTiming::calculate(3_000_000, &PERIPH).is_none());
        assert!(BitTiming::calculate(5_000, &PERIPH).is_none());
    }
}
