// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenLattice.

// OpenLattice is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenLattice is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenLattice.  If not, see <http://www.gnu.org/licenses/>.

//! Byte-stream helpers for the hand-rolled fixed-field codecs.
//!
//! Every wire and database layout in the lattice is a sequence of fixed-width
//! fields, so codecs are written directly against `io::Read`/`io::Write`
//! rather than a self-describing encoding.

use std::io;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use ethereum_types::{H256, H512, U128};

/// Shorthand for a malformed-input error while deserializing.
pub fn invalid_data(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}

pub fn write_h256(stream: &mut dyn io::Write, value: &H256) -> io::Result<()> {
    stream.write_all(value.as_bytes())
}

pub fn read_h256(stream: &mut dyn io::Read) -> io::Result<H256> {
    let mut bytes = [0u8; 32];
    stream.read_exact(&mut bytes)?;
    Ok(H256(bytes))
}

pub fn write_h512(stream: &mut dyn io::Write, value: &H512) -> io::Result<()> {
    stream.write_all(value.as_bytes())
}

pub fn read_h512(stream: &mut dyn io::Read) -> io::Result<H512> {
    let mut bytes = [0u8; 64];
    stream.read_exact(&mut bytes)?;
    Ok(H512(bytes))
}

/// Amounts travel big-endian, like every other numeric database field.
pub fn write_u128_be(stream: &mut dyn io::Write, value: &U128) -> io::Result<()> {
    let mut bytes = [0u8; 16];
    value.to_big_endian(&mut bytes);
    stream.write_all(&bytes)
}

pub fn read_u128_be(stream: &mut dyn io::Read) -> io::Result<U128> {
    let mut bytes = [0u8; 16];
    stream.read_exact(&mut bytes)?;
    Ok(U128::from_big_endian(&bytes))
}

pub fn write_u64_be(stream: &mut dyn io::Write, value: u64) -> io::Result<()> {
    stream.write_u64::<BigEndian>(value)
}

pub fn read_u64_be(stream: &mut dyn io::Read) -> io::Result<u64> {
    stream.read_u64::<BigEndian>()
}

/// Work nonces on legacy blocks and vote timestamps travel little-endian.
pub fn write_u64_le(stream: &mut dyn io::Write, value: u64) -> io::Result<()> {
    stream.write_u64::<LittleEndian>(value)
}

pub fn read_u64_le(stream: &mut dyn io::Read) -> io::Result<u64> {
    stream.read_u64::<LittleEndian>()
}

/// Milliseconds since the unix epoch, for sideband timestamps and samples.
pub fn seconds_since_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u128_round_trip() {
        let value = U128::from(123456789u64);
        let mut bytes = Vec::new();
        write_u128_be(&mut bytes, &value).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(read_u128_be(&mut bytes.as_slice()).unwrap(), value);
    }

    #[test]
    fn short_read_is_an_error() {
        let bytes = [0u8; 8];
        assert!(read_h256(&mut &bytes[..]).is_err());
    }
}
