//! Transport control-byte codec.
//!
//! The first byte of every TPDU carries the transport control code. For
//! data TPDUs the low two bits belong to the application layer (the top
//! bits of the 10-bit APCI); for numbered TPDUs bits 2..=5 carry the 4-bit
//! sequence number.
//!
//! ```text
//! 00 .. .. .. data (unnumbered, connectionless)
//! 01 ss ss .. data connected (numbered)
//! 10 00 00 00 connect
//! 10 00 00 01 disconnect
//! 11 ss ss 10 ack
//! 11 ss ss 11 nack
//! ```

/// Decoded first TPDU byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpdu {
    /// Unnumbered data; `apci_hi` holds the top two APCI bits.
    Data { apci_hi: u8 },
    /// Numbered data on an open connection.
    DataConnected { seq: u8, apci_hi: u8 },
    Connect,
    Disconnect,
    Ack { seq: u8 },
    Nack { seq: u8 },
}

pub const CONNECT: u8 = 0x80;
pub const DISCONNECT: u8 = 0x81;

impl Tpdu {
    /// Decodes the control byte. Returns `None` for the control codes the
    /// standard reserves.
    pub fn parse(byte: u8) -> Option<Tpdu> {
        let seq = (byte >> 2) & 0x0F;
        match byte & 0xC0 {
            0x00 => Some(Tpdu::Data {
                apci_hi: byte & 0x03,
            }),
            0x40 => Some(Tpdu::DataConnected {
                seq,
                apci_hi: byte & 0x03,
            }),
            0x80 => match byte {
                CONNECT => Some(Tpdu::Connect),
                DISCONNECT => Some(Tpdu::Disconnect),
                _ => None,
            },
            _ => match byte & 0x03 {
                0x02 => Some(Tpdu::Ack { seq }),
                0x03 => Some(Tpdu::Nack { seq }),
                _ => None,
            },
        }
    }

    /// Encodes the control byte. For data variants the APCI bits are
    /// merged back in.
    pub fn control_byte(self) -> u8 {
        match self {
            Tpdu::Data { apci_hi } => apci_hi & 0x03,
            Tpdu::DataConnected { seq, apci_hi } => 0x40 | ((seq & 0x0F) << 2) | (apci_hi & 0x03),
            Tpdu::Connect => CONNECT,
            Tpdu::Disconnect => DISCONNECT,
            Tpdu::Ack { seq } => 0xC2 | ((seq & 0x0F) << 2),
            Tpdu::Nack { seq } => 0xC3 | ((seq & 0x0F) << 2),
        }
    }
}

/// Builds an unnumbered data TPDU around a TSDU.
pub fn data(tsdu: &[u8]) -> Vec<u8> {
    let mut tpdu = tsdu.to_vec();
    tpdu[0] &= 0x03;
    tpdu
}

/// Builds a numbered data TPDU around a TSDU.
pub fn data_connected(seq: u8, tsdu: &[u8]) -> Vec<u8> {
    let mut tpdu = tsdu.to_vec();
    tpdu[0] = Tpdu::DataConnected {
        seq,
        apci_hi: tsdu[0],
    }
    .control_byte();
    tpdu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_codes_round_trip() {
        for seq in 0..16 {
            for tpdu in [
                Tpdu::Data { apci_hi: 0x03 },
                Tpdu::DataConnected { seq, apci_hi: 0x01 },
                Tpdu::Connect,
                Tpdu::Disconnect,
                Tpdu::Ack { seq },
                Tpdu::Nack { seq },
            ] {
                assert_eq!(Tpdu::parse(tpdu.control_byte()), Some(tpdu));
            }
        }
    }

    #[test]
    fn fixed_encodings() {
        assert_eq!(Tpdu::Connect.control_byte(), 0x80);
        assert_eq!(Tpdu::Disconnect.control_byte(), 0x81);
        assert_eq!(Tpdu::Ack { seq: 0 }.control_byte(), 0xC2);
        assert_eq!(Tpdu::Ack { seq: 3 }.control_byte(), 0xCE);
        assert_eq!(Tpdu::Nack { seq: 3 }.control_byte(), 0xCF);
        assert_eq!(
            Tpdu::DataConnected {
                seq: 0,
                apci_hi: 0
            }
            .control_byte(),
            0x40
        );
    }

    #[test]
    fn reserved_codes_rejected() {
        assert_eq!(Tpdu::parse(0x82), None);
        assert_eq!(Tpdu::parse(0xC0), None);
        assert_eq!(Tpdu::parse(0xC1), None);
    }

    #[test]
    fn data_builders_merge_apci_bits() {
        let tsdu = [0x03, 0xD5, 0x00, 0x0B, 0x10, 0x01];
        assert_eq!(data(&tsdu)[0], 0x03);
        let numbered = data_connected(5, &tsdu);
        assert_eq!(numbered[0], 0x40 | (5 << 2) | 0x03);
        assert_eq!(&numbered[1..], &tsdu[1..]);
    }
}
