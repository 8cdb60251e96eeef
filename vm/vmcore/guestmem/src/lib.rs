// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory access for the device models.
//!
//! [`GuestMemory`] is the channel a device uses to DMA into and out of guest
//! RAM. This implementation backs the whole guest physical address space
//! with a single zero-initialized heap range starting at address zero;
//! platforms with sparse or mapped memory substitute their own backing
//! behind the same surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An error accessing guest memory.
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    /// The access runs outside the guest address space.
    #[error("guest memory access out of range: {len} bytes at {gpa:#x}")]
    OutOfRange {
        /// Guest physical address of the access.
        gpa: u64,
        /// Length of the access in bytes.
        len: usize,
    },
}

/// A guest physical address space.
///
/// Cheaply cloneable; clones refer to the same backing memory.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Arc<RwLock<Box<[u8]>>>,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("len", &self.inner.read().len())
            .finish()
    }
}

impl GuestMemory {
    /// Allocates a zeroed guest address space of `size` bytes starting at
    /// guest physical address zero.
    pub fn allocate(size: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(vec![0; size].into_boxed_slice())),
        }
    }

    /// Returns the size of the address space in bytes.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if the address space is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_range(&self, gpa: u64, len: usize, total: usize) -> Result<usize, GuestMemoryError> {
        let start = usize::try_from(gpa).map_err(|_| GuestMemoryError::OutOfRange { gpa, len })?;
        let end = start
            .checked_add(len)
            .ok_or(GuestMemoryError::OutOfRange { gpa, len })?;
        if end > total {
            return Err(GuestMemoryError::OutOfRange { gpa, len });
        }
        Ok(start)
    }

    /// Writes `src` into guest memory at `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut mem = self.inner.write();
        let start = self.check_range(gpa, src.len(), mem.len())?;
        mem[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Reads guest memory at `gpa` into `dst`.
    pub fn read_at(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mem = self.inner.read();
        let start = self.check_range(gpa, dst.len(), mem.len())?;
        dst.copy_from_slice(&mem[start..start + dst.len()]);
        Ok(())
    }

    /// Writes an object into guest memory at `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        gpa: u64,
        value: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, value.as_bytes())
    }

    /// Reads an object from guest memory at `gpa`.
    pub fn read_plain<T: FromBytes + IntoBytes + KnownLayout>(
        &self,
        gpa: u64,
    ) -> Result<T, GuestMemoryError> {
        let mut value = T::new_zeroed();
        self.read_at(gpa, value.as_mut_bytes())?;
        Ok(value)
    }
}
