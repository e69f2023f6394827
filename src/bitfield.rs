//! Wrapper types and helpers around bitvec.

use bitvec::prelude::*;

use crate::error::Error;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// An all-zero bitfield sized for `num_pieces` pieces.
pub fn empty(num_pieces: u32) -> Bitfield {
    bitvec![u8, Msb0; 0; num_pieces as usize]
}

/// An all-one bitfield sized for `num_pieces` pieces.
pub fn full(num_pieces: u32) -> Bitfield {
    bitvec![u8, Msb0; 1; num_pieces as usize]
}

/// Builds a bitfield from wire bytes, validating it against the expected
/// piece count: the byte length must be exactly `ceil(num_pieces / 8)` and
/// every spare bit past the last piece must be zero.
pub fn from_wire(bytes: &[u8], num_pieces: u32) -> Result<Bitfield, Error> {
    let expected_bytes = (num_pieces as usize).div_ceil(8);
    if bytes.len() != expected_bytes {
        return Err(Error::BitfieldSize);
    }

    let mut bitfield = Bitfield::from_slice(bytes);
    if bitfield[num_pieces as usize..].any() {
        return Err(Error::BitfieldSize);
    }
    bitfield.truncate(num_pieces as usize);

    Ok(bitfield)
}

/// Serializes a bitfield to wire bytes, spare bits zeroed.
pub fn to_wire(bitfield: &Bitfield) -> Vec<u8> {
    let mut padded = bitfield.clone();
    padded.set_uninitialized(false);
    padded.into_vec()
}
