//! Wallet addresses and their getter-argument encoding.
//!
//! Gateways serving toncenter v2 `runGetMethod` take an address argument as a `tvm.Slice`:
//! a base64 bag-of-cells holding one cell with the `addr_std` bits. Addresses are accepted
//! in raw form (`0:83df..`) or user-friendly form (48 base64 or base64url characters with a
//! CRC16 trailer).

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use thiserror::Error;

/// Stack tag for a slice argument on the wire.
pub const TAG_SLICE: &str = "tvm.Slice";

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];
/// `addr_std$10 anycast:(Maybe Anycast) workchain_id:int8 address:bits256`
const ADDR_STD_BITS: usize = 2 + 1 + 8 + 256;
const FRIENDLY_LEN: usize = 48;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("malformed address {0:?}")]
    Malformed(String),
    #[error("address {0:?} fails its checksum")]
    Checksum(String),
    #[error("workchain {0} does not fit in 8 bits")]
    Workchain(i32),
}

/// Parsed standard address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl TonAddress {
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let s = s.trim();
        if s.contains(':') {
            Self::parse_raw(s)
        } else {
            Self::parse_friendly(s)
        }
    }

    fn parse_raw(s: &str) -> Result<Self, AddressParseError> {
        let malformed = || AddressParseError::Malformed(s.to_string());
        let (wc, hex) = s.split_once(':').ok_or_else(malformed)?;
        let wc: i32 = wc.parse().map_err(|_| malformed())?;
        let workchain = i8::try_from(wc).map_err(|_| AddressParseError::Workchain(wc))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = hex
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(malformed)?;
        }
        Ok(Self { workchain, hash })
    }

    fn parse_friendly(s: &str) -> Result<Self, AddressParseError> {
        let malformed = || AddressParseError::Malformed(s.to_string());
        if s.len() != FRIENDLY_LEN {
            return Err(malformed());
        }
        let bytes = URL_SAFE
            .decode(s)
            .or_else(|_| STANDARD.decode(s))
            .map_err(|_| malformed())?;
        if bytes.len() != 36 {
            return Err(malformed());
        }
        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(AddressParseError::Checksum(s.to_string()));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }

    /// Single-cell bag-of-cells (no index, no CRC) holding this address, base64-encoded.
    pub fn to_slice_boc(&self) -> String {
        let mut bits = BitWriter::default();
        bits.push_bits(0b10, 2);
        bits.push_bits(0, 1);
        bits.push_bits(u64::from(self.workchain as u8), 8);
        for byte in self.hash {
            bits.push_bits(u64::from(byte), 8);
        }
        let data = bits.finish();

        // d1: no refs, ordinary, level 0. d2: floor(bits/8) + ceil(bits/8).
        let d2 = (ADDR_STD_BITS / 8 + ADDR_STD_BITS.div_ceil(8)) as u8;
        let cell_len = 2 + data.len();
        let mut boc = Vec::with_capacity(BOC_MAGIC.len() + 7 + cell_len);
        boc.extend_from_slice(&BOC_MAGIC);
        boc.push(0x01); // flags; ref index size = 1 byte
        boc.push(0x01); // offset size
        boc.push(1); // cells
        boc.push(1); // roots
        boc.push(0); // absent
        boc.push(cell_len as u8);
        boc.push(0); // root index
        boc.push(0);
        boc.push(d2);
        boc.extend_from_slice(&data);
        STANDARD.encode(boc)
    }
}

/// CRC-16/XMODEM, as used by the user-friendly address trailer.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    len: usize,
}

impl BitWriter {
    fn push_bits(&mut self, value: u64, width: usize) {
        for i in (0..width).rev() {
            self.push((value >> i) & 1 == 1);
        }
    }

    fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 0x80 >> (self.len % 8);
            }
        }
        self.len += 1;
    }

    /// Pad a partial last byte with the completion tag (a one bit, then zeros).
    fn finish(mut self) -> Vec<u8> {
        if self.len % 8 != 0 {
            self.push(true);
        }
        self.bytes
    }
}
