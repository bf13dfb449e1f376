// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assignment of decoded picture buffer slots and tracking of the reference
//! pictures they hold.
//!
//! References follow a sliding window: every reference frame takes the next
//! slot in round-robin order and replaces the oldest entry of the reference
//! list. An intra frame flushes the window.

use log::debug;
use thiserror::Error;

use crate::codec::h264::parser::DPB_MAX_SIZE;

/// Upper bound on the number of slots: every reference frame the level
/// limits allow, plus the picture being reconstructed.
pub const MAX_DPB_SLOTS: usize = DPB_MAX_SIZE + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("invalid number of DPB slots {0}, expected 1..=17")]
    InvalidSlotCount(usize),
    #[error("slot {0} is both the decode target and a reference")]
    CurrentSlotReferenced(u8),
    #[error("slot {0} is already in the reference list")]
    DuplicateReference(u8),
}

/// The slot the current picture is being decoded into.
///
/// Only [`SlotTracker::begin`] creates one, and [`SlotTracker::finish`]
/// consumes it, so a decode target can never be listed as a reference.
#[derive(Debug, PartialEq, Eq)]
pub struct CurrentSlot(u8);

impl CurrentSlot {
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// A slot holding a reference picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefSlot(u8);

impl RefSlot {
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// Picture information mirrored for each slot, as the hardware needs it for
/// the setup and reference entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotState {
    pub poc: i32,
    pub frame_num: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceEntry {
    pub slot: RefSlot,
    pub poc: i32,
    pub frame_num: u16,
}

/// Everything the backend needs to know about slots for one decode.
#[derive(Debug)]
pub struct DecodeTarget {
    pub slot: CurrentSlot,
    /// State mirrored into the current slot.
    pub setup: SlotState,
    /// Active references, oldest slot first within the window.
    pub references: Vec<ReferenceEntry>,
}

#[derive(Debug)]
pub struct SlotTracker {
    num_slots: usize,
    current_slot: u8,
    next_slot: u8,
    next_ref: usize,
    reference_usage: Vec<RefSlot>,
    slots: [SlotState; MAX_DPB_SLOTS],
}

impl SlotTracker {
    pub fn new(num_slots: usize) -> Result<Self, DpbError> {
        if num_slots == 0 || num_slots > MAX_DPB_SLOTS {
            return Err(DpbError::InvalidSlotCount(num_slots));
        }

        Ok(Self {
            num_slots,
            current_slot: 0,
            next_slot: 0,
            next_ref: 0,
            reference_usage: Vec::with_capacity(num_slots - 1),
            slots: Default::default(),
        })
    }

    /// Picks the slot for the next picture in decode order and returns it
    /// along with the pictures it may reference.
    pub fn begin(
        &mut self,
        is_intra: bool,
        poc: i32,
        frame_num: u16,
    ) -> Result<DecodeTarget, DpbError> {
        if is_intra {
            self.reference_usage.clear();
            self.next_ref = 0;
            self.next_slot = 0;
        }

        self.current_slot = self.next_slot;

        if self
            .reference_usage
            .iter()
            .any(|r| r.0 == self.current_slot)
        {
            return Err(DpbError::CurrentSlotReferenced(self.current_slot));
        }

        let setup = SlotState { poc, frame_num };
        self.slots[usize::from(self.current_slot)] = setup;

        let references = self
            .reference_usage
            .iter()
            .map(|&slot| {
                let state = self.slots[usize::from(slot.0)];
                ReferenceEntry {
                    slot,
                    poc: state.poc,
                    frame_num: state.frame_num,
                }
            })
            .collect();

        Ok(DecodeTarget {
            slot: CurrentSlot(self.current_slot),
            setup,
            references,
        })
    }

    /// Marks the decode into `slot` as complete. A reference picture enters
    /// the window, replacing the oldest one once the window is full.
    pub fn finish(&mut self, slot: CurrentSlot, is_reference: bool) -> Result<(), DpbError> {
        // A single slot is always overwritten by the next picture.
        if !is_reference || self.num_slots == 1 {
            return Ok(());
        }

        let slot = RefSlot(slot.0);

        if self
            .reference_usage
            .iter()
            .enumerate()
            .any(|(i, r)| i != self.next_ref && *r == slot)
        {
            return Err(DpbError::DuplicateReference(slot.0));
        }

        match self.reference_usage.get_mut(self.next_ref) {
            Some(entry) => *entry = slot,
            None => self.reference_usage.push(slot),
        }

        self.next_ref = (self.next_ref + 1) % (self.num_slots - 1);
        self.next_slot = ((usize::from(self.next_slot) + 1) % self.num_slots) as u8;

        debug!(
            "slot {} is now a reference, window {:?}",
            slot.0,
            self.reference_usage
                .iter()
                .map(|r| r.0)
                .collect::<Vec<_>>()
        );

        Ok(())
    }

    /// Drops all references, as when the stream is restarted.
    pub fn reset(&mut self) {
        self.reference_usage.clear();
        self.current_slot = 0;
        self.next_slot = 0;
        self.next_ref = 0;
        self.slots = Default::default();
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn current_slot(&self) -> u8 {
        self.current_slot
    }

    pub fn references(&self) -> &[RefSlot] {
        &self.reference_usage
    }

    pub fn slot_state(&self, index: u8) -> Option<&SlotState> {
        self.slots.get(usize::from(index))
    }
}
