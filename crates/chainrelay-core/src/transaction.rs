//! Signed transactions and their packet form.
//!
//! Wire layout of a transaction:
//! ```text
//! compact-u16 signature count | 64-byte signature * count | message bytes
//! ```
//! The message is carried opaquely; this crate never re-signs or inspects it.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Largest serialized transaction the relay accepts (IPv6 MTU minus headers).
pub const PACKET_DATA_SIZE: usize = 1232;

pub const SIGNATURE_BYTES: usize = 64;
pub const PUBKEY_BYTES: usize = 32;

macro_rules! base58_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = CodecError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| CodecError::WrongWidth {
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl FromStr for $name {
            type Err = CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| CodecError::Base58(e.to_string()))?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bs58::encode(self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

base58_bytes!(Signature, SIGNATURE_BYTES);
base58_bytes!(Pubkey, PUBKEY_BYTES);

/// A signed transaction in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    signatures: Vec<Signature>,
    message: Vec<u8>,
}

/// Transaction encoding for the HTTP path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Base58,
    Base64,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base58 => write!(f, "base58"),
            Self::Base64 => write!(f, "base64"),
        }
    }
}

impl FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base58" => Ok(Self::Base58),
            "base64" => Ok(Self::Base64),
            other => Err(CodecError::UnknownEncoding(other.to_string())),
        }
    }
}

impl Transaction {
    pub fn new(signatures: Vec<Signature>, message: Vec<u8>) -> Self {
        Self { signatures, message }
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// The fee payer's signature, which identifies the transaction on-ledger.
    pub fn signature(&self) -> Option<&Signature> {
        self.signatures.first()
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn serialized_len(&self) -> usize {
        compact_u16_len(self.signatures.len()) + self.signatures.len() * SIGNATURE_BYTES
            + self.message.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        encode_compact_u16(self.signatures.len() as u16, &mut out);
        for sig in &self.signatures {
            out.extend_from_slice(sig.as_bytes());
        }
        out.extend_from_slice(&self.message);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let (count, prefix) = decode_compact_u16(bytes)?;
        let sig_bytes = usize::from(count) * SIGNATURE_BYTES;
        let body = &bytes[prefix..];
        if body.len() < sig_bytes {
            return Err(CodecError::Truncated {
                needed: prefix + sig_bytes,
                available: bytes.len(),
            });
        }
        let signatures = body[..sig_bytes]
            .chunks_exact(SIGNATURE_BYTES)
            .map(Signature::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            signatures,
            message: body[sig_bytes..].to_vec(),
        })
    }

    pub fn encode(&self, encoding: Encoding) -> String {
        let bytes = self.serialize();
        match encoding {
            Encoding::Base58 => bs58::encode(bytes).into_string(),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode(s: &str, encoding: Encoding) -> Result<Self, CodecError> {
        let bytes = match encoding {
            Encoding::Base58 => bs58::decode(s)
                .into_vec()
                .map_err(|e| CodecError::Base58(e.to_string()))?,
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| CodecError::Base64(e.to_string()))?,
        };
        Self::deserialize(&bytes)
    }
}

/// Packet metadata as the relay's submission API expects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMeta {
    pub size: u64,
    pub addr: String,
    pub port: u32,
    pub sender_stake: u64,
}

/// Submission wire form of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub data: Vec<u8>,
    pub meta: PacketMeta,
}

impl From<&Transaction> for Packet {
    fn from(tx: &Transaction) -> Self {
        let data = tx.serialize();
        Self {
            meta: PacketMeta {
                size: data.len() as u64,
                ..Default::default()
            },
            data,
        }
    }
}

impl TryFrom<&Packet> for Transaction {
    type Error = CodecError;

    fn try_from(packet: &Packet) -> Result<Self, Self::Error> {
        if packet.meta.size != packet.data.len() as u64 {
            return Err(CodecError::SizeMismatch {
                declared: packet.meta.size,
                actual: packet.data.len(),
            });
        }
        Transaction::deserialize(&packet.data)
    }
}

fn compact_u16_len(n: usize) -> usize {
    match n {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        _ => 3,
    }
}

fn encode_compact_u16(mut n: u16, out: &mut Vec<u8>) {
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

fn decode_compact_u16(bytes: &[u8]) -> Result<(u16, usize), CodecError> {
    let mut value: u32 = 0;
    for i in 0..3 {
        let byte = *bytes.get(i).ok_or(CodecError::Truncated {
            needed: i + 1,
            available: bytes.len(),
        })?;
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            // Non-minimal encodings (trailing zero continuation) are rejected.
            if i > 0 && byte == 0 {
                return Err(CodecError::InvalidLength);
            }
            return u16::try_from(value)
                .map(|v| (v, i + 1))
                .map_err(|_| CodecError::InvalidLength);
        }
    }
    Err(CodecError::InvalidLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sigs: u8, message_len: usize) -> Transaction {
        Transaction::new(
            (0..sigs).map(|i| Signature([i + 1; SIGNATURE_BYTES])).collect(),
            (0..message_len).map(|i| (i % 251) as u8).collect(),
        )
    }

    #[test]
    fn packet_round_trip_is_byte_identical() {
        let original = tx(2, 300);
        let packet = Packet::from(&original);
        assert_eq!(packet.meta.size, packet.data.len() as u64);

        let back = Transaction::try_from(&packet).unwrap();
        assert_eq!(back, original);
        assert_eq!(back.serialize(), packet.data);
    }

    #[test]
    fn serialized_len_matches_serialize() {
        for (sigs, len) in [(1u8, 0usize), (1, 1100), (3, 50)] {
            let t = tx(sigs, len);
            assert_eq!(t.serialized_len(), t.serialize().len());
        }
    }

    #[test]
    fn compact_u16_boundaries() {
        for (n, encoded) in [
            (0u16, vec![0x00]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x80, 0x01]),
            (0x3fff, vec![0xff, 0x7f]),
            (0x4000, vec![0x80, 0x80, 0x01]),
            (0xffff, vec![0xff, 0xff, 0x03]),
        ] {
            let mut out = Vec::new();
            encode_compact_u16(n, &mut out);
            assert_eq!(out, encoded, "encoding {n:#x}");
            assert_eq!(decode_compact_u16(&out).unwrap(), (n, encoded.len()));
            assert_eq!(compact_u16_len(n as usize), encoded.len());
        }
        assert_eq!(decode_compact_u16(&[0x80, 0x00]), Err(CodecError::InvalidLength));
    }

    #[test]
    fn truncated_signatures_rejected() {
        let mut bytes = tx(2, 10).serialize();
        bytes.truncate(1 + SIGNATURE_BYTES + 3);
        assert!(matches!(
            Transaction::deserialize(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn packet_with_lying_meta_rejected() {
        let mut packet = Packet::from(&tx(1, 20));
        packet.meta.size += 1;
        assert!(matches!(
            Transaction::try_from(&packet),
            Err(CodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn base58_and_base64_encodings_decode_back() {
        let t = tx(1, 64);
        for enc in [Encoding::Base58, Encoding::Base64] {
            assert_eq!(Transaction::decode(&t.encode(enc), enc).unwrap(), t);
        }
    }

    #[test]
    fn encoding_names() {
        assert_eq!("base64".parse::<Encoding>(), Ok(Encoding::Base64));
        assert_eq!(
            "hex".parse::<Encoding>(),
            Err(CodecError::UnknownEncoding("hex".into()))
        );
    }

    #[test]
    fn signature_display_parses_back() {
        let sig = Signature([9; SIGNATURE_BYTES]);
        let parsed: Signature = sig.to_string().parse().unwrap();
        assert_eq!(parsed, sig);
        assert!("not-base58!".parse::<Signature>().is_err());
        assert!(matches!(
            bs58::encode([1u8; 10]).into_string().parse::<Pubkey>(),
            Err(CodecError::WrongWidth { expected: 32, actual: 10 })
        ));
    }
}
