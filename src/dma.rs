//! DMA-capable memory regions.
//!
//! Regions are carved out once at startup from 32-byte aligned storage and
//! live for the rest of the process. Software never copies their contents
//! between stages: a [`DmaBuffer`] is only an address plus a length, and which
//! stage (or which piece of hardware) may touch the bytes behind it is decided
//! by the buffer queues that hand the handle around.

use std::fmt;
use std::ptr::NonNull;

use crate::error::{PipelineError, Result};

/// Alignment of every region handed out by [`DmaPool`].
pub const DMA_ALIGN: usize = 32;

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct Line([u8; DMA_ALIGN]);

/// Handle to a fixed-address region shared with DMA hardware.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The handle itself is just an address. Exclusive access to the bytes is
// enforced by the queue protocol, not by the type.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wrap an externally owned region. Returns `None` for a null pointer.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay valid for the rest of the process.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_aligned(&self, align: usize) -> bool {
        self.addr() % align == 0
    }

    /// View `len` bytes starting at `offset` as a region of its own.
    pub fn slice(&self, offset: usize, len: usize) -> Option<DmaBuffer> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset is within the original allocation.
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        NonNull::new(ptr).map(|ptr| DmaBuffer { ptr, len })
    }

    /// # Safety
    /// The caller must currently own the buffer through its queue and no
    /// hardware may be writing to it.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    /// The caller must currently own the buffer exclusively through its queue
    /// (or be the hardware model the buffer was programmed into).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaBuffer({:#x}, {} bytes)", self.addr(), self.len)
    }
}

/// A set of equally sized, 32-byte aligned regions with process lifetime.
pub struct DmaPool {
    name: &'static str,
    buffers: Vec<DmaBuffer>,
}

impl DmaPool {
    /// Allocate `count` zeroed regions of `len` bytes each.
    ///
    /// Every region starts on a [`DMA_ALIGN`] boundary, so the stride between
    /// regions is `len` rounded up to the alignment.
    pub fn new(name: &'static str, count: usize, len: usize) -> Result<Self> {
        if count == 0 || len == 0 {
            return Err(PipelineError::contract(format!(
                "{name}: cannot allocate {count} regions of {len} bytes"
            )));
        }
        let stride = align_up(len, DMA_ALIGN);
        let lines = stride / DMA_ALIGN * count;
        let storage = vec![Line([0; DMA_ALIGN]); lines].into_boxed_slice();
        // Never freed: the regions are programmed into hardware for the whole run.
        let base = Box::into_raw(storage) as *mut Line as *mut u8;

        let buffers = (0..count)
            .map(|i| {
                // SAFETY: i * stride + len <= lines * DMA_ALIGN, inside the leaked allocation.
                unsafe { DmaBuffer::from_raw_parts(base.add(i * stride), len) }.ok_or_else(|| {
                    PipelineError::contract(format!("{name}: null region {i}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { name, buffers })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffers(&self) -> &[DmaBuffer] {
        &self.buffers
    }

    pub fn get(&self, index: usize) -> Option<DmaBuffer> {
        self.buffers.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Region length in bytes (all regions share it).
    pub fn region_len(&self) -> usize {
        self.buffers.first().map(DmaBuffer::len).unwrap_or(0)
    }
}
