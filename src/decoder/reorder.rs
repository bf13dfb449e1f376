// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Holds decoded pictures until their turn to be displayed comes.

use log::debug;

/// How [`ReorderQueue::tick`] chooses the next picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPolicy {
    /// Only the picture following the displayed one may be shown.
    InOrder,
    /// Prefer the next picture in order, otherwise show the lowest display
    /// order available so playback never stalls behind a missing picture.
    #[default]
    LowestAvailable,
}

/// A decoded picture waiting for, or in, display.
#[derive(Debug)]
pub struct ReorderedPicture<P> {
    pub picture: P,
    pub display_order: usize,
    /// Index of the frame in decode order.
    pub frame_index: usize,
    /// Seconds the picture stays on screen.
    pub duration: f64,
}

/// Storage for decoded pictures is recycled through a free list. New storage
/// is only requested from `alloc_cb` when the free list is empty.
pub struct ReorderQueue<P> {
    alloc_cb: Box<dyn FnMut() -> P>,
    free: Vec<P>,
    working: Vec<ReorderedPicture<P>>,
    displayed: Option<ReorderedPicture<P>>,
    countdown: f64,
    target: usize,
    policy: PresentPolicy,
}

impl<P> ReorderQueue<P> {
    pub fn new(alloc_cb: Box<dyn FnMut() -> P>, policy: PresentPolicy) -> Self {
        Self {
            alloc_cb,
            free: Vec::new(),
            working: Vec::new(),
            displayed: None,
            countdown: 0.0,
            target: 0,
            policy,
        }
    }

    /// Stores a decoded picture. `fill` copies the decoder output into the
    /// picture storage; if it fails the storage is kept for later use and
    /// the picture is dropped.
    pub fn on_decoded<E>(
        &mut self,
        display_order: usize,
        frame_index: usize,
        duration: f64,
        fill: impl FnOnce(&mut P) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut picture = match self.free.pop() {
            Some(picture) => picture,
            None => (self.alloc_cb)(),
        };

        if let Err(e) = fill(&mut picture) {
            self.free.push(picture);
            return Err(e);
        }

        self.working.push(ReorderedPicture {
            picture,
            display_order,
            frame_index,
            duration,
        });

        Ok(())
    }

    fn pick(&self) -> Option<usize> {
        let exact = self
            .working
            .iter()
            .position(|p| p.display_order == self.target);

        match (exact, self.policy) {
            (Some(index), _) => Some(index),
            (None, PresentPolicy::InOrder) => None,
            (None, PresentPolicy::LowestAvailable) => self
                .working
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.display_order)
                .map(|(index, _)| index),
        }
    }

    /// Advances the display clock by `elapsed` seconds. Returns the new
    /// picture to display if it changed.
    ///
    /// The picture changes once the current one has been shown for its
    /// duration. A tick that does not advance the clock never changes it.
    pub fn tick(&mut self, elapsed: f64) -> Option<&ReorderedPicture<P>> {
        self.countdown -= elapsed;
        if elapsed <= 0.0 || self.countdown > 0.0 {
            return None;
        }

        let index = self.pick()?;
        let next = self.working.swap_remove(index);

        debug!(
            "displaying frame {} (display order {}, expected {})",
            next.frame_index, next.display_order, self.target
        );

        self.countdown = next.duration;
        // A late picture shown by the fallback leaves the target alone.
        self.target = self.target.max(next.display_order + 1);

        if let Some(previous) = self.displayed.replace(next) {
            self.free.push(previous.picture);
        }

        self.displayed.as_ref()
    }

    /// Returns every picture waiting for display to the free list, as when
    /// playback restarts from the first frame.
    pub fn reset(&mut self) {
        self.free
            .extend(self.working.drain(..).map(|pending| pending.picture));
        self.target = 0;
    }

    pub fn displayed(&self) -> Option<&ReorderedPicture<P>> {
        self.displayed.as_ref()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Display order of the picture expected next.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn policy(&self) -> PresentPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    /// A queue of `u32` pictures counting its allocations.
    fn queue(policy: PresentPolicy) -> (ReorderQueue<u32>, Rc<Cell<u32>>) {
        let allocated = Rc::new(Cell::new(0));
        let counter = Rc::clone(&allocated);
        let alloc_cb = Box::new(move || {
            counter.set(counter.get() + 1);
            0
        });

        (ReorderQueue::new(alloc_cb, policy), allocated)
    }

    fn push(queue: &mut ReorderQueue<u32>, display_order: usize, frame_index: usize) {
        queue
            .on_decoded(display_order, frame_index, 1.0, |p| {
                *p = frame_index as u32;
                Ok::<(), ()>(())
            })
            .unwrap();
    }

    fn total(queue: &ReorderQueue<u32>) -> usize {
        queue.free_len() + queue.working_len() + usize::from(queue.displayed().is_some())
    }

    #[test]
    fn displays_in_order() {
        let (mut queue, _) = queue(PresentPolicy::InOrder);
        push(&mut queue, 1, 0);
        push(&mut queue, 0, 1);

        assert_eq!(queue.tick(1.0).unwrap().display_order, 0);
        assert_eq!(queue.target(), 1);
        // Not due yet.
        assert!(queue.tick(0.5).is_none());
        let shown = queue.tick(0.5).unwrap();
        assert_eq!(shown.display_order, 1);
        assert_eq!(shown.picture, 0);
    }

    #[test]
    fn in_order_waits_for_missing_picture() {
        let (mut queue, _) = queue(PresentPolicy::InOrder);
        push(&mut queue, 2, 0);

        assert!(queue.tick(1.0).is_none());
        assert!(queue.displayed().is_none());

        push(&mut queue, 0, 1);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 0);
    }

    #[test]
    fn lowest_available_skips_ahead() {
        let (mut queue, _) = queue(PresentPolicy::default());
        push(&mut queue, 5, 0);
        push(&mut queue, 3, 1);

        assert_eq!(queue.tick(1.0).unwrap().display_order, 3);
        assert_eq!(queue.target(), 4);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 5);
        assert!(queue.tick(1.0).is_none());
        assert_eq!(queue.displayed().unwrap().display_order, 5);
    }

    #[test]
    fn late_picture_does_not_move_the_target_back() {
        let (mut queue, _) = queue(PresentPolicy::LowestAvailable);
        push(&mut queue, 0, 0);
        queue.tick(1.0).unwrap();

        // P frame shown before the B frame preceding it arrives.
        push(&mut queue, 3, 1);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 3);
        assert_eq!(queue.target(), 4);

        push(&mut queue, 1, 2);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 1);
        assert_eq!(queue.target(), 4);

        push(&mut queue, 5, 3);
        push(&mut queue, 4, 4);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 4);
        assert_eq!(queue.target(), 5);
        assert_eq!(queue.tick(1.0).unwrap().display_order, 5);
        assert_eq!(queue.target(), 6);
    }

    #[test]
    fn zero_ticks_never_change_the_display() {
        let (mut queue, _) = queue(PresentPolicy::default());
        push(&mut queue, 0, 0);
        push(&mut queue, 1, 1);

        for _ in 0..10 {
            assert!(queue.tick(0.0).is_none());
            assert!(queue.displayed().is_none());
        }

        queue.tick(1.0).unwrap();
        for _ in 0..10 {
            assert!(queue.tick(0.0).is_none());
            assert_eq!(queue.displayed().unwrap().display_order, 0);
        }
    }

    #[test]
    fn storage_is_conserved() {
        let (mut queue, allocated) = queue(PresentPolicy::default());

        // Fill a three picture pipeline, then keep it in steady state.
        for i in 0..3 {
            push(&mut queue, i, i);
        }
        queue.tick(1.0).unwrap();
        assert_eq!(total(&queue), 3);

        for i in 3..20 {
            push(&mut queue, i, i);
            queue.tick(1.0).unwrap();
            assert_eq!(total(&queue), allocated.get() as usize);
        }

        // Two queued, one displayed and one recycled.
        assert_eq!(allocated.get(), 4);
        assert_eq!(queue.working_len(), 2);
        assert_eq!(queue.free_len(), 1);
    }

    #[test]
    fn failed_fill_recycles_storage() {
        let (mut queue, allocated) = queue(PresentPolicy::default());

        let err = queue.on_decoded(0, 0, 1.0, |_| Err("copy failed"));
        assert_eq!(err, Err("copy failed"));
        assert_eq!(queue.free_len(), 1);
        assert_eq!(queue.working_len(), 0);

        push(&mut queue, 0, 0);
        assert_eq!(allocated.get(), 1);
        assert_eq!(queue.free_len(), 0);
    }

    #[test]
    fn reset_returns_pending_pictures() {
        let (mut queue, _) = queue(PresentPolicy::default());
        for i in 0..3 {
            push(&mut queue, i, i);
        }
        queue.tick(1.0).unwrap();

        queue.reset();
        assert_eq!(queue.working_len(), 0);
        assert_eq!(queue.free_len(), 2);
        assert_eq!(queue.target(), 0);
        assert_eq!(queue.displayed().unwrap().display_order, 0);
    }
}
