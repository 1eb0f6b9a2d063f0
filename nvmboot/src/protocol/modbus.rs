//! Modbus RTU transport.
//!
//! Update-protocol packets travel inside a user-defined function code:
//!
//! ```text
//! +------+----------+-------------+------------------+--------+--------+
//! | node | function | payload len | payload          | CRC lo | CRC hi |
//! | 1 B  | 1 B      | 1 B         | payload len B    | 1 B    | 1 B    |
//! +------+----------+-------------+------------------+--------+--------+
//! ```
//!
//! Frames are delimited by T3.5, the line silence of 3.5 character times,
//! measured on the fine 10 µs counter. Anything that fails validation is
//! dropped without a response, as a Modbus slave must.

use log::{debug, trace, warn};

use crate::config::ModbusConfig;
use crate::error::{Error, Result};
use crate::hal::{Clock, FineCounter, NoWatchdog, RtuLine, Watchdog};
use crate::poll::{delay_us, poll_ticks_until, poll_until};
use crate::protocol::crc::crc16_modbus;
use crate::protocol::packet::{MAX_PACKET_LEN, Packet, check_len};
use crate::protocol::{PacketTransport, TransportKind};

/// Bytes a frame adds around the payload: node, function, length and CRC.
pub const FRAME_OVERHEAD: usize = 5;

/// Largest frame this transport can buffer.
pub const MAX_FRAME_LEN: usize = MAX_PACKET_LEN + FRAME_OVERHEAD;

/// Smallest frame that is validated at all.
const MIN_FRAME_LEN: usize = 4;

/// T3.5 used above 19200 bps: 1750 µs.
const FIXED_T35_TICKS: u16 = 175;

/// T3.5 in 10 µs ticks for `baudrate`.
///
/// Above 19200 bps the Modbus specification fixes T3.5 at 1750 µs. Below it
/// is 3.5 characters of 11 bits, rounded up, plus one tick for counter
/// resolution.
pub fn t35_ticks(baudrate: u32) -> u16 {
    if baudrate > 19_200 {
        return FIXED_T35_TICKS;
    }
    let ticks = 3_850_000u32.div_ceil(baudrate.max(1)) + 1;
    u16::try_from(ticks).unwrap_or(u16::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Receiving { len: usize },
    /// Frame too long; ignore bytes until the line goes silent.
    Overflowed,
}

/// Modbus RTU slave transport over a half-duplex [`RtuLine`].
///
/// `T` provides both the millisecond clock (byte timeouts, idle-wait bound)
/// and the fine counter (T3.5, driver delays).
pub struct ModbusRtu<L, T, W = NoWatchdog> {
    line: L,
    timer: T,
    watchdog: W,
    config: ModbusConfig,
    t35: u16,
    state: RxState,
    last_byte_tick: u16,
    last_activity_tick: u16,
    buffer: [u8; MAX_FRAME_LEN],
}

impl<L, T, W> ModbusRtu<L, T, W>
where
    L: RtuLine,
    T: Clock + FineCounter,
    W: Watchdog,
{
    /// Create the transport. The configuration is validated and T3.5 is
    /// computed here.
    pub fn new(line: L, timer: T, watchdog: W, config: ModbusConfig) -> Result<Self> {
        config.validate()?;
        let t35 = t35_ticks(config.baudrate);
        debug!(
            "Modbus RTU node {} at {} bps, T3.5 = {} µs",
            config.node_id,
            config.baudrate,
            u32::from(t35) * crate::hal::FINE_TICK_US
        );
        let now = timer.ticks();
        Ok(Self {
            line,
            timer,
            watchdog,
            config,
            t35,
            state: RxState::Idle,
            last_byte_tick: now,
            last_activity_tick: now,
            buffer: [0u8; MAX_FRAME_LEN],
        })
    }

    /// T3.5 in fine ticks.
    pub fn t35(&self) -> u16 {
        self.t35
    }

    /// Configuration in use.
    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    /// Borrow the line.
    pub fn line(&self) -> &L {
        &self.line
    }

    /// Mutably borrow the line.
    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    /// Consume the transport and return the line.
    pub fn into_line(self) -> L {
        self.line
    }

    /// Switch to receive mode and wait for an idle line.
    ///
    /// Input buffered below the line primitive is dropped first. Bytes seen
    /// before T3.5 of silence are discarded so a fragment left over
    /// from before reset is never mistaken for a frame start. The wait gives
    /// up after `idle_wait_timeout_ms` on a line that never goes quiet.
    pub fn init(&mut self) {
        self.line.set_driver_output(false);
        self.line.discard_input();
        self.state = RxState::Idle;

        let timeout_ms = self.config.idle_wait_timeout_ms;
        let Self {
            line,
            timer,
            watchdog,
            t35,
            ..
        } = self;
        let t35 = *t35;
        let mut start = timer.ticks();
        let mut discarded = 0usize;
        let idle = poll_until(&*timer, &*watchdog, timeout_ms, || {
            let now = timer.ticks();
            if line.receive_byte().is_some() {
                start = now;
                discarded += 1;
            }
            now.wrapping_sub(start) >= t35
        });

        if idle {
            debug!("Modbus line idle, {discarded} stale bytes discarded");
        } else {
            warn!("Modbus line not idle after {timeout_ms} ms, starting reception anyway");
        }
        let now = self.timer.ticks();
        self.last_byte_tick = now;
        self.last_activity_tick = now;
    }

    /// Poll the line and return a packet once a valid frame is complete.
    ///
    /// Never blocks. Frames with a bad CRC, another node id or function code,
    /// or an inconsistent length are dropped silently.
    pub fn receive_packet(&mut self) -> Option<Packet> {
        let now = self.timer.ticks();

        if let Some(byte) = self.line.receive_byte() {
            self.last_byte_tick = now;
            self.last_activity_tick = now;
            let capacity = usize::from(self.config.max_rx_data) + FRAME_OVERHEAD;
            match self.state {
                RxState::Idle => {
                    self.buffer[0] = byte;
                    self.state = RxState::Receiving { len: 1 };
                },
                RxState::Receiving { len } if len < capacity => {
                    self.buffer[len] = byte;
                    self.state = RxState::Receiving { len: len + 1 };
                },
                RxState::Receiving { .. } => {
                    warn!("Modbus frame longer than {capacity} bytes, discarding");
                    self.state = RxState::Overflowed;
                },
                RxState::Overflowed => {},
            }
        }

        if self.state == RxState::Idle || now.wrapping_sub(self.last_byte_tick) < self.t35 {
            return None;
        }

        let state = std::mem::replace(&mut self.state, RxState::Idle);
        match state {
            RxState::Receiving { len } => self.validate_frame(len),
            RxState::Idle | RxState::Overflowed => None,
        }
    }

    /// Send `data` as one frame.
    ///
    /// Waits for T3.5 since the last line activity, drives the line for the
    /// frame and always releases it afterwards, also when a byte times out.
    pub fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        check_len(data.len(), usize::from(self.config.max_tx_data))?;

        let mut frame = [0u8; MAX_FRAME_LEN];
        let len = data.len() + FRAME_OVERHEAD;
        frame[0] = self.config.node_id;
        frame[1] = self.config.function_code;
        frame[2] = u8::try_from(data.len()).unwrap_or(u8::MAX);
        frame[3..3 + data.len()].copy_from_slice(data);
        let crc = crc16_modbus(&frame[..len - 2]);
        frame[len - 2..len].copy_from_slice(&crc.to_le_bytes());

        self.wait_inter_frame_gap();

        delay_us(&self.timer, &self.watchdog, self.config.driver_enable_delay_us);
        self.line.set_driver_output(true);
        delay_us(&self.timer, &self.watchdog, self.config.driver_enable_delay_us);

        trace!("tx frame {:02X?}", &frame[..len]);
        let result = self.send_frame(&frame[..len]);

        delay_us(&self.timer, &self.watchdog, self.config.driver_disable_delay_us);
        self.line.set_driver_output(false);
        delay_us(&self.timer, &self.watchdog, self.config.driver_disable_delay_us);
        self.last_activity_tick = self.timer.ticks();

        result
    }

    fn wait_inter_frame_gap(&mut self) {
        let elapsed = self.timer.ticks().wrapping_sub(self.last_activity_tick);
        if elapsed < self.t35 {
            poll_ticks_until(&self.timer, &self.watchdog, self.t35 - elapsed, || false);
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let timeout = self.config.byte_tx_timeout_ms;
        let Self {
            line,
            timer,
            watchdog,
            ..
        } = self;

        for &byte in frame {
            if !poll_until(&*timer, &*watchdog, timeout, || {
                line.is_tx_ready() && line.write_byte(byte)
            }) {
                return Err(Error::Timeout(format!(
                    "modbus transmitter not ready within {timeout} ms"
                )));
            }
        }
        if !poll_until(&*timer, &*watchdog, timeout, || line.is_tx_complete()) {
            return Err(Error::Timeout(format!(
                "modbus transmission not complete within {timeout} ms"
            )));
        }
        Ok(())
    }

    fn validate_frame(&self, len: usize) -> Option<Packet> {
        if len < MIN_FRAME_LEN {
            trace!("Dropping {len}-byte fragment");
            return None;
        }
        let frame = &self.buffer[..len];
        let (body, crc) = frame.split_at(len - 2);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        let calculated = crc16_modbus(body);
        if received != calculated {
            debug!("Dropping frame with CRC {received:#06x}, expected {calculated:#06x}");
            return None;
        }
        if frame[0] != self.config.node_id || frame[1] != self.config.function_code {
            trace!("Ignoring frame for node {} function {}", frame[0], frame[1]);
            return None;
        }
        if len < FRAME_OVERHEAD || usize::from(frame[2]) != len - FRAME_OVERHEAD {
            debug!("Dropping frame with length field {} in {len} bytes", frame[2]);
            return None;
        }
        Packet::new(&frame[3..len - 2]).ok()
    }
}

impl<L, T, W> PacketTransport for ModbusRtu<L, T, W>
where
    L: RtuLine,
    T: Clock + FineCounter,
    W: Watchdog,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Modbus
    }

    fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        ModbusRtu::transmit_packet(self, data)
    }

    fn receive_packet(&mut self) -> Option<Packet> {
        ModbusRtu::receive_packet(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{CountingWatchdog, MockChannel, MockClock};

    type Rtu<'a> = ModbusRtu<MockChannel, &'a MockClock>;

    fn rtu(clock: &MockClock, config: ModbusConfig) -> Rtu<'_> {
        ModbusRtu::new(MockChannel::default(), clock, NoWatchdog, config).unwrap()
    }

    fn frame(node: u8, function: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![node, function, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Feed `bytes`, poll once per byte, then let T3.5 pass and poll again.
    fn deliver(rtu: &mut Rtu<'_>, clock: &MockClock, bytes: &[u8]) -> Option<Packet> {
        rtu.line_mut().feed(bytes);
        for _ in bytes {
            assert!(rtu.receive_packet().is_none());
        }
        clock.advance_ticks(rtu.t35());
        rtu.receive_packet()
    }

    #[test]
    fn test_t35_ticks() {
        assert_eq!(t35_ticks(9600), 403);
        assert_eq!(t35_ticks(19_200), 202);
        assert_eq!(t35_ticks(19_201), 175);
        assert_eq!(t35_ticks(115_200), 175);
        assert_eq!(t35_ticks(1200), 3210);
    }

    #[test]
    fn test_valid_frame_delivered() {
        let clock = MockClock::default();
        let mut rtu = rtu(&clock, ModbusConfig::default());
        let packet = deliver(&mut rtu, &clock, &frame(1, 109, &[0xFF, 0x00])).unwrap();
        assert_eq!(packet.payload(), &[0xFF, 0x00]);
        // Delivered once.
        clock.advance_ticks(1000);
        assert!(rtu.receive_packet().is_none());
    }

    #[test]
    fn test_not_delivered_before_t35() {
        let clock = MockClock::default();
        let mut rtu = rtu(&clock, ModbusConfig::default());
        let bytes = frame(1, 109, &[0x01]);
        rtu.line_mut().feed(&bytes);
        for _ in &bytes {
            rtu.receive_packet();
        }
        clock.advance_ticks(rtu.t35() - 1);
        assert!(rtu.receive_packet().is_none());
        clock.advance_ticks(1);
        assert!(rtu.receive_packet().is_some());
    }

    #[test]
    fn test_invalid_frames_dropped() {
        let clock = MockClock::default();
        let mut rtu = rtu(&clock, ModbusConfig::default());

        let mut bad_crc = frame(1, 109, &[1, 2, 3]);
        let last = bad_crc.len() - 1;
        bad_crc[last] ^= 0x01;
        assert!(deliver(&mut rtu, &clock, &bad_crc).is_none());

        assert!(deliver(&mut rtu, &clock, &frame(2, 109, &[1, 2, 3])).is_none());
        assert!(deliver(&mut rtu, &clock, &frame(1, 3, &[1, 2, 3])).is_none());

        let mut bad_len = vec![1, 109, 4, 1, 2, 3];
        let crc = crc16_modbus(&bad_len);
        bad_len.extend_from_slice(&crc.to_le_bytes());
        assert!(deliver(&mut rtu, &clock, &bad_len).is_none());

        assert!(deliver(&mut rtu, &clock, &[1, 109, 0]).is_none());

        // Still works afterwards.
        let packet = deliver(&mut rtu, &clock, &frame(1, 109, &[7])).unwrap();
        assert_eq!(packet.payload(), &[7]);
    }

    #[test]
    fn test_overflow_discards_until_silence() {
        let clock = MockClock::default();
        let config = ModbusConfig {
            max_rx_data: 4,
            ..ModbusConfig::default()
        };
        let mut rtu = rtu(&clock, config);

        // A valid-looking prefix followed by too many bytes.
        let mut long = frame(1, 109, &[1, 2, 3, 4]);
        long.extend_from_slice(&[0xAA; 8]);
        assert!(deliver(&mut rtu, &clock, &long).is_none());

        let packet = deliver(&mut rtu, &clock, &frame(1, 109, &[1, 2, 3, 4])).unwrap();
        assert_eq!(packet.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_init_discards_stale_bytes() {
        let clock = MockClock::stepping(0, 20);
        let wd = CountingWatchdog::default();
        let mut line = MockChannel::default();
        line.feed(&[0x42, 0x01, 0x6D]);
        let mut rtu = ModbusRtu::new(line, &clock, &wd, ModbusConfig::default()).unwrap();

        rtu.init();
        assert!(rtu.line().rx.is_empty());
        assert_eq!(rtu.line().discards, 1);
        assert_eq!(rtu.line().driver_log, vec![false]);
        assert!(wd.count.get() > 0);
    }

    #[test]
    fn test_init_gives_up_on_busy_line() {
        let clock = MockClock::stepping(1, 1);
        let mut line = MockChannel::default();
        line.feed(&[0x55; 4096]);
        let config = ModbusConfig {
            idle_wait_timeout_ms: 50,
            ..ModbusConfig::default()
        };
        let mut rtu = ModbusRtu::new(line, &clock, NoWatchdog, config).unwrap();
        rtu.init();
        assert!(!rtu.line().rx.is_empty());
    }

    #[test]
    fn test_transmit_frame_and_driver_control() {
        let clock = MockClock::stepping(0, 1);
        let mut rtu = rtu(&clock, ModbusConfig::default());
        rtu.transmit_packet(&[0xFF, 0x00]).unwrap();

        assert_eq!(rtu.line().tx, frame(1, 109, &[0xFF, 0x00]));
        assert_eq!(rtu.line().driver_log, vec![true, false]);
        assert!(rtu.line().complete_checks > 0);
    }

    #[test]
    fn test_transmit_timeout_releases_driver() {
        let clock = MockClock::stepping(1, 1);
        let mut rtu = rtu(&clock, ModbusConfig::default());
        rtu.line_mut().tx_stuck = true;

        assert!(matches!(
            rtu.transmit_packet(&[1, 2]),
            Err(Error::Timeout(_))
        ));
        assert_eq!(rtu.line().driver_log, vec![true, false]);
    }

    #[test]
    fn test_transmit_rejects_bad_length() {
        let clock = MockClock::stepping(0, 1);
        let config = ModbusConfig {
            max_tx_data: 2,
            ..ModbusConfig::default()
        };
        let mut rtu = rtu(&clock, config);
        assert!(matches!(
            rtu.transmit_packet(&[1, 2, 3]),
            Err(Error::PacketLength { len: 3, max: 2 })
        ));
        assert!(rtu.line().driver_log.is_empty());
    }

    #[test]
    fn test_transmitted_frame_is_accepted_by_peer() {
        let tx_clock = MockClock::stepping(0, 1);
        let mut tx = rtu(&tx_clock, ModbusConfig::default().with_node_id(9));
        tx.transmit_packet(b"hello").unwrap();

        let rx_clock = MockClock::default();
        let mut rx = rtu(&rx_clock, ModbusConfig::default().with_node_id(9));
        let wire = tx.line().tx.clone();
        let packet = deliver(&mut rx, &rx_clock, &wire).unwrap();
        assert_eq!(packet.payload(), b"hello");
    }
}
