// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minimal ISO BMFF reader exposing the first AVC video track of a file.

use std::io::Cursor;
use std::io::Read;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use log::debug;

use crate::stream::container::Demuxer;
use crate::stream::container::Sample;
use crate::stream::container::NAL_LENGTH_SIZE;
use crate::Resolution;

/// Size of the fixed part of a `VisualSampleEntry`, before its child boxes.
const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;

/// Upper bound on the sample count of a track with a constant sample size.
const MAX_SAMPLES: u32 = 1 << 24;

/// Iterates over the boxes contained in `data`, yielding their type and
/// body.
struct Boxes<'a> {
    data: &'a [u8],
}

impl<'a> Boxes<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn read_next(&mut self) -> anyhow::Result<([u8; 4], &'a [u8])> {
        let mut cursor = Cursor::new(self.data);
        let size32 = cursor.read_u32::<BigEndian>()?;
        let mut fourcc = [0u8; 4];
        cursor.read_exact(&mut fourcc)?;

        let size = match size32 {
            // Box extends to the end of its parent.
            0 => self.data.len() as u64,
            1 => cursor.read_u64::<BigEndian>()?,
            size => u64::from(size),
        };

        let header_size = cursor.position();
        if size < header_size || size > self.data.len() as u64 {
            bail!(
                "invalid size {} for box {}",
                size,
                String::from_utf8_lossy(&fourcc)
            );
        }

        let body = &self.data[header_size as usize..size as usize];
        self.data = &self.data[size as usize..];

        Ok((fourcc, body))
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = anyhow::Result<([u8; 4], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let item = self.read_next();
        if item.is_err() {
            self.data = &[];
        }

        Some(item)
    }
}

/// Returns the body of the first child box of type `fourcc`.
fn find_box<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> anyhow::Result<Option<&'a [u8]>> {
    for item in Boxes::new(data) {
        let (box_type, body) = item?;
        if &box_type == fourcc {
            return Ok(Some(body));
        }
    }

    Ok(None)
}

fn require_box<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> anyhow::Result<&'a [u8]> {
    find_box(data, fourcc)?
        .ok_or_else(|| anyhow!("missing {} box", String::from_utf8_lossy(fourcc)))
}

/// Skips the version and flags of a full box, returning the version.
fn read_full_box_header(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<u8> {
    let version = cursor.read_u8()?;
    cursor.read_u24::<BigEndian>()?;
    Ok(version)
}

fn parse_mdhd_timescale(body: &[u8]) -> anyhow::Result<u32> {
    let mut cursor = Cursor::new(body);
    let version = read_full_box_header(&mut cursor)?;

    // creation_time and modification_time
    if version == 1 {
        cursor.read_u64::<BigEndian>()?;
        cursor.read_u64::<BigEndian>()?;
    } else {
        cursor.read_u32::<BigEndian>()?;
        cursor.read_u32::<BigEndian>()?;
    }

    Ok(cursor.read_u32::<BigEndian>()?)
}

fn parse_hdlr_type(body: &[u8]) -> anyhow::Result<[u8; 4]> {
    let mut cursor = Cursor::new(body);
    read_full_box_header(&mut cursor)?;
    // pre_defined
    cursor.read_u32::<BigEndian>()?;

    let mut handler_type = [0u8; 4];
    cursor.read_exact(&mut handler_type)?;
    Ok(handler_type)
}

/// Decoder configuration of an `avc1`/`avc3` sample entry.
struct AvcConfig {
    resolution: Resolution,
    sps: Vec<Vec<u8>>,
    pps: Vec<Vec<u8>>,
}

fn read_parameter_sets(cursor: &mut Cursor<&[u8]>, count: u8) -> anyhow::Result<Vec<Vec<u8>>> {
    (0..count)
        .map(|_| -> anyhow::Result<Vec<u8>> {
            let len = cursor.read_u16::<BigEndian>()?;
            let mut nal = vec![0u8; usize::from(len)];
            cursor.read_exact(&mut nal)?;
            Ok(nal)
        })
        .collect()
}

fn parse_avcc(body: &[u8]) -> anyhow::Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let mut cursor = Cursor::new(body);

    let version = cursor.read_u8()?;
    if version != 1 {
        bail!("unsupported avcC version {}", version);
    }

    // profile, compatibility, level
    cursor.read_u24::<BigEndian>()?;

    let nal_length_size = usize::from(cursor.read_u8()? & 0x3) + 1;
    if nal_length_size != NAL_LENGTH_SIZE {
        bail!("unsupported NAL length size {}", nal_length_size);
    }

    let num_sps = cursor.read_u8()? & 0x1f;
    let sps = read_parameter_sets(&mut cursor, num_sps).context("reading avcC SPS")?;
    let num_pps = cursor.read_u8()?;
    let pps = read_parameter_sets(&mut cursor, num_pps).context("reading avcC PPS")?;

    Ok((sps, pps))
}

/// Looks for an AVC sample entry in `stsd`.
fn parse_stsd(body: &[u8]) -> anyhow::Result<Option<AvcConfig>> {
    let mut cursor = Cursor::new(body);
    read_full_box_header(&mut cursor)?;
    let entry_count = cursor.read_u32::<BigEndian>()?;

    let entries = &body[cursor.position() as usize..];
    for item in Boxes::new(entries).take(entry_count as usize) {
        let (format, entry) = item?;
        if &format != b"avc1" && &format != b"avc3" {
            debug!(
                "skipping {} sample entry",
                String::from_utf8_lossy(&format)
            );
            continue;
        }

        if entry.len() < VISUAL_SAMPLE_ENTRY_SIZE {
            bail!("truncated visual sample entry");
        }

        // reserved, data_reference_index, pre_defined and reserved
        let mut cursor = Cursor::new(&entry[24..]);
        let width = u32::from(cursor.read_u16::<BigEndian>()?);
        let height = u32::from(cursor.read_u16::<BigEndian>()?);

        let avcc = require_box(&entry[VISUAL_SAMPLE_ENTRY_SIZE..], b"avcC")?;
        let (sps, pps) = parse_avcc(avcc)?;

        return Ok(Some(AvcConfig {
            resolution: Resolution { width, height },
            sps,
            pps,
        }));
    }

    Ok(None)
}

/// Reads `count` big-endian entries of a table following a full box header
/// and an entry count.
fn read_table<T>(
    body: &[u8],
    mut read_entry: impl FnMut(&mut Cursor<&[u8]>, u8) -> std::io::Result<T>,
) -> anyhow::Result<Vec<T>> {
    let mut cursor = Cursor::new(body);
    let version = read_full_box_header(&mut cursor)?;
    let count = cursor.read_u32::<BigEndian>()?;

    // Each entry is at least 4 bytes.
    if u64::from(count) * 4 > body.len() as u64 {
        bail!("table claims {} entries in {} bytes", count, body.len());
    }

    (0..count)
        .map(|_| read_entry(&mut cursor, version).map_err(anyhow::Error::from))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SampleLocation {
    offset: u64,
    size: u32,
    timestamp: i64,
    duration: u64,
}

fn parse_sample_sizes(body: &[u8]) -> anyhow::Result<Vec<u32>> {
    let mut cursor = Cursor::new(body);
    read_full_box_header(&mut cursor)?;
    let sample_size = cursor.read_u32::<BigEndian>()?;
    let count = cursor.read_u32::<BigEndian>()?;

    if sample_size != 0 {
        if count > MAX_SAMPLES {
            bail!("too many samples: {}", count);
        }
        return Ok(vec![sample_size; count as usize]);
    }

    if u64::from(count) * 4 > body.len() as u64 {
        bail!("stsz claims {} entries in {} bytes", count, body.len());
    }

    (0..count)
        .map(|_| cursor.read_u32::<BigEndian>().map_err(anyhow::Error::from))
        .collect()
}

/// Builds the location and timing of every sample from the sample table.
fn parse_stbl(stbl: &[u8]) -> anyhow::Result<Vec<SampleLocation>> {
    let sizes = parse_sample_sizes(require_box(stbl, b"stsz")?).context("parsing stsz")?;

    let chunk_offsets = match find_box(stbl, b"stco")? {
        Some(body) => read_table(body, |c, _| c.read_u32::<BigEndian>().map(u64::from))?,
        None => read_table(require_box(stbl, b"co64")?, |c, _| c.read_u64::<BigEndian>())?,
    };

    // (first_chunk, samples_per_chunk), sample_description_index is ignored.
    let stsc = read_table(require_box(stbl, b"stsc")?, |c, _| {
        let first_chunk = c.read_u32::<BigEndian>()?;
        let samples_per_chunk = c.read_u32::<BigEndian>()?;
        c.read_u32::<BigEndian>()?;
        Ok((first_chunk, samples_per_chunk))
    })
    .context("parsing stsc")?;

    let stts = read_table(require_box(stbl, b"stts")?, |c, _| {
        Ok((c.read_u32::<BigEndian>()?, c.read_u32::<BigEndian>()?))
    })
    .context("parsing stts")?;

    let ctts = match find_box(stbl, b"ctts")? {
        Some(body) => read_table(body, |c, version| {
            let count = c.read_u32::<BigEndian>()?;
            let offset = if version == 0 {
                i64::from(c.read_u32::<BigEndian>()?)
            } else {
                i64::from(c.read_i32::<BigEndian>()?)
            };
            Ok((count, offset))
        })
        .context("parsing ctts")?,
        None => Vec::new(),
    };

    // Offsets, chunk by chunk.
    let mut offsets = Vec::with_capacity(sizes.len());
    for (i, &(first_chunk, samples_per_chunk)) in stsc.iter().enumerate() {
        let last_chunk = stsc
            .get(i + 1)
            .map(|&(next, _)| next.saturating_sub(1))
            .unwrap_or(chunk_offsets.len() as u32);

        for chunk in first_chunk.max(1)..=last_chunk {
            let mut offset = *chunk_offsets
                .get(chunk as usize - 1)
                .ok_or_else(|| anyhow!("stsc refers to missing chunk {}", chunk))?;

            for _ in 0..samples_per_chunk {
                let Some(&size) = sizes.get(offsets.len()) else {
                    break;
                };
                offsets.push(offset);
                offset += u64::from(size);
            }
        }
    }

    if offsets.len() != sizes.len() {
        bail!(
            "sample table maps {} of {} samples",
            offsets.len(),
            sizes.len()
        );
    }

    let durations = stts
        .iter()
        .flat_map(|&(count, delta)| std::iter::repeat(u64::from(delta)).take(count as usize));
    let composition_offsets = ctts
        .iter()
        .flat_map(|&(count, offset)| std::iter::repeat(offset).take(count as usize))
        .chain(std::iter::repeat(0));

    let mut decode_time = 0i64;
    let samples = sizes
        .iter()
        .zip(offsets)
        .zip(durations.chain(std::iter::repeat(0)))
        .zip(composition_offsets)
        .map(|(((&size, offset), duration), composition_offset)| {
            let sample = SampleLocation {
                offset,
                size,
                timestamp: decode_time + composition_offset,
                duration,
            };
            decode_time += duration as i64;
            sample
        })
        .collect();

    Ok(samples)
}

/// The first AVC video track of an MP4 file.
pub struct Mp4Demuxer {
    data: Vec<u8>,
    timescale: u32,
    config: AvcConfig,
    samples: Vec<SampleLocation>,
}

/// Returns the timescale, decoder configuration and samples of the first AVC
/// video track.
fn parse_moov(data: &[u8]) -> anyhow::Result<(u32, AvcConfig, Vec<SampleLocation>)> {
    let moov = require_box(data, b"moov")?;

    for item in Boxes::new(moov) {
        let (box_type, trak) = item?;
        if &box_type != b"trak" {
            continue;
        }

        let mdia = require_box(trak, b"mdia")?;
        let handler_type = parse_hdlr_type(require_box(mdia, b"hdlr")?)?;
        if &handler_type != b"vide" {
            continue;
        }

        let stbl = require_box(require_box(mdia, b"minf")?, b"stbl")?;
        let config = match parse_stsd(require_box(stbl, b"stsd")?).context("parsing stsd")? {
            Some(config) => config,
            None => continue,
        };

        let timescale = parse_mdhd_timescale(require_box(mdia, b"mdhd")?)?;
        let samples = parse_stbl(stbl)?;

        return Ok((timescale, config, samples));
    }

    Err(anyhow!("no AVC video track found"))
}

impl Mp4Demuxer {
    pub fn new(data: Vec<u8>) -> anyhow::Result<Self> {
        let (timescale, config, samples) = parse_moov(&data)?;

        debug!(
            "AVC track: {}x{}, {} samples, timescale {}",
            config.resolution.width,
            config.resolution.height,
            samples.len(),
            timescale
        );

        Ok(Self {
            data,
            timescale,
            config,
            samples,
        })
    }
}

impl Demuxer for Mp4Demuxer {
    fn timescale(&self) -> u32 {
        self.timescale
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Option<Sample<'_>> {
        let location = self.samples.get(index)?;
        let start = usize::try_from(location.offset).ok()?;
        let data = self.data.get(start..start.checked_add(location.size as usize)?)?;

        Some(Sample {
            offset: location.offset,
            timestamp: location.timestamp,
            duration: location.duration,
            data,
        })
    }

    fn sps(&self) -> &[Vec<u8>] {
        &self.config.sps
    }

    fn pps(&self) -> &[Vec<u8>] {
        &self.config.pps
    }

    fn resolution(&self) -> Resolution {
        self.config.resolution
    }
}
