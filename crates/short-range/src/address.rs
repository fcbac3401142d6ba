//! Bluetooth Device Addresses
//!
//! Addresses are written as twelve hex digits with no separators, optionally
//! followed by the address type: `p` for public, `r` for random
//! (e.g. `0012F398DD12p`). Parsing is case-insensitive.

use crate::error::ShortRangeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of hex digits in an address
pub const ADDRESS_HEX_LEN: usize = 12;

/// Bluetooth address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
}

/// A 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BtAddress {
    pub bytes: [u8; 6],
    /// Explicit type suffix, if one was given
    pub kind: Option<AddressType>,
}

impl BtAddress {
    /// Parse an address string
    pub fn parse(s: &str) -> Result<Self, ShortRangeError> {
        let out_of_range = || ShortRangeError::ValueOutOfRange(format!("address {:?}", s));

        let (digits, kind) = match s.len() {
            ADDRESS_HEX_LEN => (s, None),
            n if n == ADDRESS_HEX_LEN + 1 => {
                let kind = match s.as_bytes()[ADDRESS_HEX_LEN] {
                    b'p' | b'P' => AddressType::Public,
                    b'r' | b'R' => AddressType::Random,
                    _ => return Err(out_of_range()),
                };
                (&s[..ADDRESS_HEX_LEN], Some(kind))
            }
            _ => return Err(out_of_range()),
        };

        let decoded = hex::decode(digits).map_err(|_| out_of_range())?;
        let bytes: [u8; 6] = decoded.try_into().map_err(|_| out_of_range())?;
        Ok(Self { bytes, kind })
    }
}

impl FromStr for BtAddress {
    type Err = ShortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.bytes))?;
        match self.kind {
            Some(AddressType::Public) => f.write_str("p"),
            Some(AddressType::Random) => f.write_str("r"),
            None => Ok(()),
        }
    }
}
