//! Logical packet exchanged with the update protocol.

use std::fmt;

use crate::error::{Error, Result};

/// Largest payload any transport can carry.
pub const MAX_PACKET_LEN: usize = 255;

/// One reassembled packet payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    len: u8,
    data: [u8; MAX_PACKET_LEN],
}

impl Packet {
    /// Copy `payload` into a packet. Fails for empty or oversized payloads.
    pub fn new(payload: &[u8]) -> Result<Self> {
        let len = u8::try_from(payload.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or(Error::PacketLength {
                len: payload.len(),
                max: MAX_PACKET_LEN,
            })?;
        let mut data = [0u8; MAX_PACKET_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self { len, data })
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Always `false`; packets carry at least one byte.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("payload", &self.payload())
            .finish()
    }
}

/// Check `len` against `1..=max`.
pub(crate) fn check_len(len: usize, max: usize) -> Result<()> {
    if len == 0 || len > max {
        return Err(Error::PacketLength { len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let packet = Packet::new(&[0xFF, 0x00]).unwrap();
        assert_eq!(packet.len(), 2);
        assert_eq!(packet.payload(), &[0xFF, 0x00]);
        assert!(!packet.is_empty());
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(Packet::new(&[]).is_err());
        assert!(Packet::new(&[0; 256]).is_err());
        assert!(Packet::new(&[0; 255]).is_ok());
    }

    #[test]
    fn test_check_len() {
        assert!(check_len(8, 8).is_ok());
        assert!(matches!(
            check_len(9, 8),
            Err(Error::PacketLength { len: 9, max: 8 })
        ));
        assert!(check_len(0, 8).is_err());
    }
}
