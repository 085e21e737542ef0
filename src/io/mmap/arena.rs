use log::{debug, error, info, warn};
use std::{io, mem, ptr::NonNull, slice};

use crate::buffer::State;
use crate::device::Device;
use crate::error::{other, Error, Result};
use crate::memory::Memory;

/// One driver buffer mapped into the process
struct Slot {
    ptr: NonNull<u8>,
    length: usize,
    state: State,
}

/// Manage mapped buffers
///
/// The arena owns every mapping of its buffers and unmaps them together, using the lengths
/// recorded while mapping. Each buffer is tracked by index as either driver-owned (queued) or
/// application-owned (dequeued).
///
/// All buffers are unmapped in [`Arena::release`] or, failing that, in the Drop impl.
///
/// The device is borrowed mutably for the lifetime of the arena. A second pool on the same
/// device would free this one's driver buffers, so it does not compile:
///
/// ```compile_fail
/// use v4lcap::{Arena, Handle};
///
/// if let Ok(mut dev) = Handle::open("/dev/video0") {
///     let first = Arena::allocate(&mut dev, 4);
///     let second = Arena::allocate(&mut dev, 4);
///     drop((first, second));
/// }
/// ```
pub struct Arena<'a, D: Device + ?Sized> {
    dev: &'a mut D,
    slots: Vec<Slot>,
    released: bool,
}

impl<'a, D: Device + ?Sized> Arena<'a, D> {
    /// Requests, maps and queues buffers
    ///
    /// The driver may grant fewer (or more) buffers than requested; the granted count is the
    /// size of the arena. Once this returns, every buffer is queued and owned by the driver.
    /// If any step fails, everything mapped so far is unmapped again before the error is
    /// returned.
    ///
    /// # Arguments
    ///
    /// * `dev` - Device with a configured format
    /// * `count` - Desired number of buffers
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::{Arena, Handle};
    ///
    /// if let Ok(mut dev) = Handle::open("/dev/video0") {
    ///     if let Ok(arena) = Arena::allocate(&mut dev, 4) {
    ///         println!("{} buffers", arena.len());
    ///         let _ = arena.release();
    ///     }
    /// }
    /// ```
    pub fn allocate(dev: &'a mut D, count: u32) -> Result<Self> {
        let granted = dev.request_buffers(count).map_err(Error::AllocationFailed)?;

        // from here on, dropping the arena gives everything back to the driver
        let mut arena = Arena {
            dev,
            slots: Vec::with_capacity(granted as usize),
            released: false,
        };

        if granted == 0 {
            return Err(Error::AllocationFailed(other("driver granted no buffers")));
        }
        if granted != count {
            debug!("requested {} buffers, driver granted {}", count, granted);
        }

        for index in 0..granted {
            let placement = arena
                .dev
                .query_buffer(index)
                .map_err(Error::AllocationFailed)?;
            let ptr = arena.dev.map(&placement).map_err(Error::AllocationFailed)?;
            arena.slots.push(Slot {
                ptr,
                length: placement.length as usize,
                state: State::Application,
            });
        }

        arena.enqueue_all()?;

        info!(
            "allocated {} {} buffers ({} bytes each)",
            granted,
            Memory::Mmap,
            arena.slots.first().map_or(0, |slot| slot.length)
        );
        Ok(arena)
    }

    /// Unmaps every buffer and frees them in the driver
    ///
    /// Regions are unmapped with the lengths recorded by [`Arena::allocate`], whatever state
    /// they are in. Every region is attempted even if one fails; the first failure is
    /// returned. Streaming must be stopped first, which [`crate::Stream`] takes care of.
    pub fn release(mut self) -> Result<()> {
        self.unmap_all()
    }

    /// Hands every application-owned buffer back to the driver
    ///
    /// Allocation ends with this; after a stream was stopped it prepares the arena for a
    /// restart.
    pub fn enqueue_all(&mut self) -> Result<()> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == State::Driver {
                continue;
            }

            self.dev
                .queue_buffer(index as u32)
                .map_err(Error::AllocationFailed)?;
            slot.state = State::Driver;
        }

        Ok(())
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena holds no buffers
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ownership of the buffer at the specified index
    pub fn state(&self, index: usize) -> Option<State> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// Mapped length of the buffer at the specified index
    pub fn buffer_len(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.length)
    }

    /// Whether the driver owns every buffer
    pub fn all_queued(&self) -> bool {
        self.slots.iter().all(|slot| slot.state == State::Driver)
    }

    /// The device the buffers belong to
    pub fn device(&self) -> &D {
        self.dev
    }

    /// Marks a buffer the driver just returned as application-owned
    pub(crate) fn take(&mut self, index: u32) -> io::Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.state != State::Driver {
            return Err(other("driver returned a buffer it did not own"));
        }

        slot.state = State::Application;
        Ok(())
    }

    /// Read-only view of an application-owned buffer
    ///
    /// `bytesused` is clamped to the mapped length. Drivers reporting 0 get the whole buffer.
    pub(crate) fn view(&self, index: u32, bytesused: u32) -> io::Result<&[u8]> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or_else(|| other("buffer index out of range"))?;
        if slot.state != State::Application {
            return Err(other("buffer is owned by the driver"));
        }

        let len = match bytesused as usize {
            0 => slot.length,
            used => used.min(slot.length),
        };

        // the driver does not touch a dequeued buffer until it is queued again, which needs
        // &mut self and thus outlives the returned borrow
        Ok(unsafe { slice::from_raw_parts(slot.ptr.as_ptr(), len) })
    }

    /// Queues an application-owned buffer, handing it back to the driver
    pub(crate) fn requeue(&mut self, index: u32) -> io::Result<()> {
        if self.slot_mut(index)?.state != State::Application {
            return Err(other("buffer is already queued"));
        }

        self.dev.queue_buffer(index)?;
        self.slot_mut(index)?.state = State::Driver;
        Ok(())
    }

    /// Streaming was turned off: the driver gave up every buffer
    pub(crate) fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.state = State::Application;
        }
    }

    fn slot_mut(&mut self, index: u32) -> io::Result<&mut Slot> {
        self.slots
            .get_mut(index as usize)
            .ok_or_else(|| other("buffer index out of range"))
    }

    pub(crate) fn unmap_all(&mut self) -> Result<()> {
        self.released = true;

        let slots = mem::take(&mut self.slots);
        let count = slots.len();
        let mut result = Ok(());
        for (index, slot) in slots.into_iter().enumerate() {
            if let Err(e) = unsafe { self.dev.unmap(slot.ptr, slot.length) } {
                error!("failed to unmap buffer {}: {}", index, e);
                if result.is_ok() {
                    result = Err(Error::UnmapFailed(e));
                }
            }
        }

        // free all buffers by requesting 0
        if let Err(e) = self.dev.request_buffers(0) {
            warn!("failed to free driver buffers: {}", e);
        }

        debug!("released {} buffers", count);
        result
    }
}

impl<'a, D: Device + ?Sized> Drop for Arena<'a, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(e) = self.unmap_all() {
            error!("buffer teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn granted_count_is_the_pool_size() {
        let mut dev = MockDevice::new().with_max_buffers(3);
        let arena = Arena::allocate(&mut dev, 4).expect("allocation should succeed");

        assert_eq!(arena.len(), 3);
        for index in 0..3 {
            assert_eq!(arena.state(index), Some(State::Driver));
        }
        assert_eq!(arena.state(3), None);
        assert_eq!(arena.device().queued(), vec![0, 1, 2]);
        assert_eq!(arena.device().live_mappings(), 3);

        arena.release().expect("release should succeed");
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(dev.unmap_calls(), 3);
        assert_eq!(dev.allocated(), 0);
    }

    #[test]
    fn map_failure_at_any_index_rolls_back() {
        for fail_at in 0..4 {
            let mut dev = MockDevice::new().fail_map_at(fail_at);
            match Arena::allocate(&mut dev, 4) {
                Err(Error::AllocationFailed(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
                Ok(_) => panic!("allocation must fail when mapping {} fails", fail_at),
            }

            assert_eq!(dev.live_mappings(), 0, "mapping {} failed", fail_at);
            assert_eq!(dev.unmap_calls(), fail_at as usize);
            assert_eq!(dev.allocated(), 0);
        }
    }

    #[test]
    fn queue_failure_rolls_back() {
        let mut dev = MockDevice::new().fail_queue_at(2);
        assert!(matches!(
            Arena::allocate(&mut dev, 4),
            Err(Error::AllocationFailed(_))
        ));
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(dev.unmap_calls(), 4);
        assert!(dev.queued().is_empty());
    }

    #[test]
    fn zero_grant_fails() {
        let mut dev = MockDevice::new().with_max_buffers(0);
        assert!(matches!(
            Arena::allocate(&mut dev, 4),
            Err(Error::AllocationFailed(_))
        ));
        assert_eq!(dev.live_mappings(), 0);
    }

    #[test]
    fn release_uses_recorded_lengths_not_a_new_query() {
        let mut dev = MockDevice::new().with_max_buffers(3);
        let arena = Arena::allocate(&mut dev, 8).expect("allocation should succeed");
        let lengths: Vec<_> = (0..arena.len())
            .map(|index| arena.buffer_len(index).expect("buffer exists"))
            .collect();

        // the device would now hand out a different number of buffers
        arena.device().set_max_buffers(6);
        arena.release().expect("release should succeed");

        assert_eq!(dev.unmap_calls(), 3);
        assert_eq!(dev.unmapped_lengths(), lengths);
        assert_eq!(dev.live_mappings(), 0);
    }

    #[test]
    fn every_region_is_attempted_when_one_unmap_fails() {
        let mut dev = MockDevice::new().with_max_buffers(4);
        let arena = Arena::allocate(&mut dev, 4).expect("allocation should succeed");

        arena.device().set_fail_unmap_at(Some(1));
        assert!(matches!(arena.release(), Err(Error::UnmapFailed(_))));
        assert_eq!(dev.unmap_calls(), 4);
        assert_eq!(dev.live_mappings(), 1);
    }

    #[test]
    fn drop_unmaps_everything() {
        let mut dev = MockDevice::new();
        {
            let arena = Arena::allocate(&mut dev, 4).expect("allocation should succeed");
            assert_eq!(arena.device().live_mappings(), 4);
        }
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(dev.allocated(), 0);
    }

    #[test]
    fn pool_keeps_its_buffers_until_released() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut arena = Arena::allocate(&mut dev, 2).expect("allocation should succeed");

        // the only way to reach the device is through the pool, which never frees buffers
        // behind its own back
        arena.enqueue_all().expect("queued buffers are skipped");
        assert_eq!(arena.device().allocated(), 2);
        assert_eq!(arena.device().queued(), vec![0, 1]);
        arena.release().expect("release should succeed");

        // once released, the device is free for a new pool
        let arena = Arena::allocate(&mut dev, 2).expect("second pool after release");
        assert_eq!(arena.device().live_mappings(), 2);
        assert!(arena.all_queued());
    }

    #[test]
    fn ownership_transitions_are_checked() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut arena = Arena::allocate(&mut dev, 2).expect("allocation should succeed");

        // driver-owned buffers can neither be viewed nor requeued
        assert!(arena.view(0, 0).is_err());
        assert!(arena.requeue(0).is_err());

        arena.take(0).expect("driver owned buffer 0");
        assert!(arena.take(0).is_err());
        assert_eq!(arena.view(0, 0).expect("view").len(), arena.buffer_len(0).unwrap());
        assert_eq!(arena.view(0, 16).expect("view").len(), 16);
        assert!(arena.take(7).is_err());

        arena.requeue(0).expect("application owned buffer 0");
        assert_eq!(arena.state(0), Some(State::Driver));
    }
}
