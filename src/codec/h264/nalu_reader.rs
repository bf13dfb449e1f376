// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use bytes::Buf;
use thiserror::Error;

/// A bit reader for h264 bitstreams. It properly handles emulation-prevention
/// bytes and stop bits.
#[derive(Clone)]
pub struct NaluReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    /// Number of epbs (i.e. 0x000003) we found.
    num_epb: usize,
}

/// Opaque reader state returned by [`NaluReader::save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedPosition {
    position: u64,
    curr_byte: u32,
    num_remaining_bits_in_curr_byte: usize,
    prev_two_bytes: u32,
    num_epb: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("invalid Exp-Golomb code")]
    InvalidExpGolomb,
    #[error("value out of bounds: expected {min} - {max}, got {value}")]
    OutOfBounds { min: i64, max: i64, value: i64 },
}

pub type ReadBitsResult<T> = std::result::Result<T, ReadBitsError>;

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> ReadBitsResult<U> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> ReadBitsResult<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Offset in the input buffer of the byte holding the next unread bit.
    /// Emulation-prevention bytes are counted, so the offset always indexes
    /// the buffer passed to [`NaluReader::new`].
    pub fn byte_offset(&self) -> usize {
        let position = self.data.position() as usize;
        if self.num_remaining_bits_in_curr_byte > 0 {
            position - 1
        } else {
            position
        }
    }

    /// Whether the reader sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Records the current position so that it can be returned to with
    /// [`NaluReader::restore`].
    pub fn save(&self) -> SavedPosition {
        SavedPosition {
            position: self.data.position(),
            curr_byte: self.curr_byte,
            num_remaining_bits_in_curr_byte: self.num_remaining_bits_in_curr_byte,
            prev_two_bytes: self.prev_two_bytes,
            num_epb: self.num_epb,
        }
    }

    pub fn restore(&mut self, saved: SavedPosition) {
        self.data.set_position(saved.position);
        self.curr_byte = saved.curr_byte;
        self.num_remaining_bits_in_curr_byte = saved.num_remaining_bits_in_curr_byte;
        self.prev_two_bytes = saved.prev_two_bytes;
        self.num_epb = saved.num_epb;
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        if self.data.chunk().iter().any(|byte| *byte != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> ReadBitsResult<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let value = if num_bits == 31 {
            // Only 2^31 - 1 + 0 fits in 32 bits.
            if self.read_bits::<u32>(31)? != 0 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
            u32::MAX >> 1
        } else if num_bits > 0 {
            ((1u32 << num_bits) - 1) + self.read_bits::<u32>(num_bits)?
        } else {
            0
        };

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> ReadBitsResult<U> {
        let ue = self.read_ue::<u32>()?;
        if ue < min || ue > max {
            return Err(ReadBitsError::OutOfBounds {
                min: min.into(),
                max: max.into(),
                value: ue.into(),
            });
        }

        U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> ReadBitsResult<U> {
        self.read_ue_bounded(0, max)
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> ReadBitsResult<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let se = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };

        i32::try_from(se)
            .ok()
            .and_then(|se| U::try_from(se).ok())
            .ok_or(ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> ReadBitsResult<U> {
        let se = self.read_se::<i32>()?;
        if se < min || se > max {
            return Err(ReadBitsError::OutOfBounds {
                min: min.into(),
                max: max.into(),
                value: se.into(),
            });
        }

        U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
    }

    fn get_byte(&mut self) -> ReadBitsResult<u8> {
        if self.data.remaining() == 0 {
            return Err(ReadBitsError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> ReadBitsResult<()> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // We found an epb
            self.num_epb += 1;
            // Read another byte
            byte = self.get_byte()?;
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}
