// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.

use std::cell::Cell;
use std::rc::Rc;
use std::str::FromStr;

use anyhow::anyhow;

use crate::codec::h264::dpb::MAX_DPB_SLOTS;
use crate::codec::h264::parser::Sps;
use crate::decoder::DecodeSource;
use crate::decoder::DecodeStep;
use crate::decoder::StatelessBackendError;
use crate::decoder::StatelessBackendResult;
use crate::decoder::StatelessH264DecoderBackend;
use crate::Resolution;

/// Baseline, main and high.
const SUPPORTED_PROFILES: [u8; 3] = [66, 77, 100];

/// Where the backend leaves decoded pictures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Decoded pictures stay in their DPB slot.
    #[default]
    Coincide,
    /// Decoded pictures are written to a separate output surface.
    Dedicated,
}

impl FromStr for OutputMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coincide" => Ok(OutputMode::Coincide),
            "dedicated" => Ok(OutputMode::Dedicated),
            _ => Err("unrecognized output mode. Valid values: coincide, dedicated"),
        }
    }
}

/// A decode request received by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeRecord {
    pub frame_index: usize,
    pub slot: u8,
    /// Slots of the references, in reference list order.
    pub references: Vec<u8>,
    pub poc: i32,
    pub frame_num: u16,
    pub offset: usize,
    pub size: usize,
}

/// A display picture, remembering what it was copied from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DummyPicture {
    pub frame_index: Option<usize>,
    pub source: Option<DecodeSource>,
    pub resolution: Resolution,
}

/// Dummy backend that can be used for any stream.
pub struct Backend {
    mode: OutputMode,
    alignment: usize,
    num_dpb_slots: usize,
    records: Vec<DecodeRecord>,
    /// Frame held by each DPB slot.
    slot_contents: [Option<usize>; MAX_DPB_SLOTS],
    /// Frame held by the dedicated output surface.
    last_output: Option<usize>,
    num_allocated: Rc<Cell<usize>>,
    fail_at: Option<usize>,
    fail_copy_at: Option<usize>,
}

impl Backend {
    pub fn new(mode: OutputMode, alignment: usize) -> Self {
        Self {
            mode,
            alignment,
            num_dpb_slots: 0,
            records: Vec::new(),
            slot_contents: Default::default(),
            last_output: None,
            num_allocated: Rc::new(Cell::new(0)),
            fail_at: None,
            fail_copy_at: None,
        }
    }

    /// Makes the decode of frame `index` fail.
    pub fn fail_at(&mut self, index: Option<usize>) {
        self.fail_at = index;
    }

    /// Makes copying the picture of frame `index` fail.
    pub fn fail_copy_at(&mut self, index: Option<usize>) {
        self.fail_copy_at = index;
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn records(&self) -> &[DecodeRecord] {
        &self.records
    }

    /// Number of pictures handed out by the picture allocator.
    pub fn num_allocated_pictures(&self) -> usize {
        self.num_allocated.get()
    }
}

impl StatelessH264DecoderBackend for Backend {
    type Picture = DummyPicture;

    fn new_sequence(&mut self, sps: &Sps, num_dpb_slots: usize) -> StatelessBackendResult<()> {
        if !SUPPORTED_PROFILES.contains(&sps.profile_idc) {
            return Err(StatelessBackendError::UnsupportedProfile(format!(
                "profile_idc {}",
                sps.profile_idc
            )));
        }

        if num_dpb_slots == 0 || num_dpb_slots > MAX_DPB_SLOTS {
            return Err(StatelessBackendError::OutOfResources);
        }

        self.num_dpb_slots = num_dpb_slots;
        self.slot_contents = Default::default();
        self.last_output = None;

        Ok(())
    }

    fn bitstream_alignment(&self) -> usize {
        self.alignment
    }

    fn picture_allocator(&mut self, resolution: Resolution) -> Box<dyn FnMut() -> DummyPicture> {
        let num_allocated = Rc::clone(&self.num_allocated);

        Box::new(move || {
            num_allocated.set(num_allocated.get() + 1);
            DummyPicture {
                resolution,
                ..Default::default()
            }
        })
    }

    fn decode(&mut self, step: &DecodeStep) -> StatelessBackendResult<DecodeSource> {
        if self.fail_at == Some(step.frame_index) {
            return Err(anyhow!("decode of frame {} failed", step.frame_index).into());
        }

        if step.data.len() != step.size {
            return Err(anyhow!(
                "frame {} has {} bytes of data for a size of {}",
                step.frame_index,
                step.data.len(),
                step.size
            )
            .into());
        }

        if self.alignment > 1 && step.offset % self.alignment != 0 {
            return Err(anyhow!(
                "frame {} at offset {} is not aligned to {}",
                step.frame_index,
                step.offset,
                self.alignment
            )
            .into());
        }

        let slot = step.target.slot.index();
        if usize::from(slot) >= self.num_dpb_slots {
            return Err(anyhow!("slot {} is out of the DPB", slot).into());
        }

        for reference in &step.target.references {
            let index = usize::from(reference.slot.index());
            if self.slot_contents[index].is_none() {
                return Err(anyhow!("reference slot {} holds no picture", index).into());
            }
        }

        self.records.push(DecodeRecord {
            frame_index: step.frame_index,
            slot,
            references: step
                .target
                .references
                .iter()
                .map(|r| r.slot.index())
                .collect(),
            poc: step.params.pic_order_cnt,
            frame_num: step.params.frame_num,
            offset: step.offset,
            size: step.size,
        });

        self.slot_contents[usize::from(slot)] = Some(step.frame_index);
        self.last_output = Some(step.frame_index);

        Ok(match self.mode {
            OutputMode::Coincide => DecodeSource::DpbSlot(slot),
            OutputMode::Dedicated => DecodeSource::DedicatedOutput,
        })
    }

    fn copy_output(
        &mut self,
        source: DecodeSource,
        picture: &mut DummyPicture,
    ) -> StatelessBackendResult<()> {
        let frame_index = match source {
            DecodeSource::DpbSlot(slot) => self
                .slot_contents
                .get(usize::from(slot))
                .copied()
                .flatten(),
            DecodeSource::DedicatedOutput => self.last_output,
        }
        .ok_or_else(|| anyhow!("nothing was decoded to {:?}", source))?;

        if self.fail_copy_at == Some(frame_index) {
            return Err(anyhow!("copy of frame {} failed", frame_index).into());
        }

        picture.frame_index = Some(frame_index);
        picture.source = Some(source);

        Ok(())
    }
}
