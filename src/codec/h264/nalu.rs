// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B start code scanning and NAL unit headers.

use std::io::Cursor;

use bytes::Buf;
use enumn::N;
use thiserror::Error;

/// The canonical 4-byte start code every extracted NAL unit is prefixed with.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    /// Unspecified and reserved types, which decoders ignore.
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NaluError {
    #[error("no start code found")]
    NoStartCode,
    #[error("NAL unit is empty")]
    Empty,
    #[error("forbidden_zero_bit is set")]
    ForbiddenBit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    /// Decodes the one byte H.264 NAL unit header.
    pub fn parse(byte: u8) -> Result<Self, NaluError> {
        if byte & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit);
        }

        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);

        Ok(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }

    /// Whether this unit carries a coded slice of a primary picture that the
    /// hardware can decode.
    pub fn is_slice(&self) -> bool {
        matches!(self.type_, NaluType::Slice | NaluType::SliceIdr)
    }

    /// Whether this header type indicates EOS.
    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    /// The length of the header.
    pub const fn len(&self) -> usize {
        1
    }
}

/// Advances `cursor` past the next `00 00 01` or `00 00 00 01` start code.
///
/// Returns `false` and leaves the cursor at the end of the buffer if no
/// start code remains.
pub fn find_next_nal(cursor: &mut Cursor<&[u8]>) -> bool {
    let data: &[u8] = *cursor.get_ref();
    let pos = cursor.position() as usize;

    match data
        .get(pos..)
        .and_then(|rest| rest.windows(3).position(|window| window == [0x00, 0x00, 0x01]))
    {
        Some(offset) => {
            cursor.set_position((pos + offset + 3) as u64);
            true
        }
        None => {
            cursor.set_position(data.len() as u64);
            false
        }
    }
}

/// Reads the NAL unit header at the cursor position.
pub fn read_nal_header(cursor: &mut Cursor<&[u8]>) -> Result<NaluHeader, NaluError> {
    if !cursor.has_remaining() {
        return Err(NaluError::Empty);
    }

    NaluHeader::parse(cursor.get_u8())
}

/// A NAL unit inside a larger buffer.
#[derive(Debug, Clone)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The buffer backing this NAL unit. Possibly shared with other units.
    pub data: &'a [u8],
    /// Size of the unit, header included, without its start code.
    pub size: usize,
    /// Offset of the header byte in `data`.
    pub offset: usize,
    /// Offset of the start code in `data`.
    pub sc_offset: usize,
}

impl<'a> Nalu<'a> {
    /// Find the next Annex B encoded NAL unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Nalu<'a>, NaluError> {
        if !find_next_nal(cursor) {
            return Err(NaluError::NoStartCode);
        }

        let data: &'a [u8] = *cursor.get_ref();
        let offset = cursor.position() as usize;

        // A preceding zero_byte makes this a four byte start code.
        let mut sc_offset = offset - 3;
        if sc_offset > 0 && data[sc_offset - 1] == 0x00 {
            sc_offset -= 1;
        }

        let header = read_nal_header(cursor)?;

        let mut end = match data[offset..]
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
        {
            Some(next) => offset + next,
            None => data.len(),
        };

        // Discard trailing_zero_8bits, as well as the zero_byte of the next
        // start code.
        while end > offset + 1 && data[end - 1] == 0x00 {
            end -= 1;
        }

        let size = if header.is_end() { 1 } else { end - offset };

        cursor.set_position((offset + size) as u64);

        Ok(Nalu {
            header,
            data,
            size,
            offset,
            sc_offset,
        })
    }

    /// Builds a NAL unit over `data`, which holds exactly one unit without
    /// any start code or length prefix.
    pub fn from_bytes(data: &'a [u8]) -> Result<Nalu<'a>, NaluError> {
        let header = NaluHeader::parse(*data.first().ok_or(NaluError::Empty)?)?;

        Ok(Nalu {
            header,
            data,
            size: data.len(),
            offset: 0,
            sc_offset: 0,
        })
    }

    /// The payload following the header byte.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.offset + self.size]
    }
}

impl<'a> AsRef<[u8]> for Nalu<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}

/// Iterates over the NAL units of an Annex B buffer. A unit with an invalid
/// header is yielded as an error and iteration resumes after it.
pub struct NalIterator<'a>(Cursor<&'a [u8]>);

impl<'a> NalIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(Cursor::new(stream))
    }
}

impl<'a> Iterator for NalIterator<'a> {
    type Item = Result<Nalu<'a>, NaluError>;

    fn next(&mut self) -> Option<Self::Item> {
        match Nalu::next(&mut self.0) {
            Err(NaluError::NoStartCode) => None,
            other => Some(other),
        }
    }
}
