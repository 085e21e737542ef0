use crate::buffer::Metadata;

/// A filled, memory mapped buffer
///
/// The buffer is backed by camera device or kernel memory.
/// Read only access (e.g. by directly uploading it to the GPU) is permitted for the lifetime of
/// the frame, which ends when the callback it was passed to returns. The driver reuses the
/// memory right afterwards, so the data has to be copied to keep it.
#[derive(Debug)]
pub struct Frame<'a> {
    view: &'a [u8],
    meta: Metadata,
    capacity: usize,
}

impl<'a> Frame<'a> {
    /// Returns a mapped memory region representation
    ///
    /// # Arguments
    ///
    /// * `view` - Slice of raw memory
    /// * `meta` - Metadata, usually filled in by the driver
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::{buffer::Metadata, Frame};
    ///
    /// let data: Vec<u8> = vec![0xff, 0xd8];
    /// let frame = Frame::new(&data, Metadata::default());
    /// assert_eq!(frame.len(), 2);
    /// assert_eq!(frame.capacity(), 2);
    /// ```
    pub fn new(view: &'a [u8], meta: Metadata) -> Self {
        Frame {
            view,
            meta,
            capacity: view.len(),
        }
    }

    /// A frame over the filled part of a mapped buffer of `capacity` bytes
    pub(crate) fn mapped(view: &'a [u8], meta: Metadata, capacity: usize) -> Self {
        Frame {
            view,
            meta,
            capacity: capacity.max(view.len()),
        }
    }

    /// Slice of read-only data
    pub fn data(&self) -> &[u8] {
        self.view
    }

    /// Start address of the mapped data
    pub fn as_ptr(&self) -> *const u8 {
        self.view.as_ptr()
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Size of the mapped buffer behind the frame, at least [`Frame::len`]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the frame carries no data
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Metadata such as the buffer index, sequence number and timestamp
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }
}
