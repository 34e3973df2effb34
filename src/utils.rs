use crate::error::Error;

use std::fmt;
use std::ops::{Deref, DerefMut, Range, RangeFrom};

/// Slice extension methods.
pub trait SliceExt<T> {
    /// Tries to obtain an element or subslice of `self`, returning an
    /// appropriate error if the range is out of bounds.
    fn try_get<R>(&self, range: R) -> Result<&R::Output, Error>
    where
        R: SliceIndex<T>;

    /// Mutable variant of `try_get`, used by the decrypting and building
    /// paths that patch regions in place.
    fn try_get_mut<R>(&mut self, range: R) -> Result<&mut R::Output, Error>
    where
        R: SliceIndex<T>;
}

impl<T> SliceExt<T> for [T] {
    fn try_get<R>(&self, range: R) -> Result<&R::Output, Error>
    where
        R: SliceIndex<T>,
    {
        range.get(self)
    }

    fn try_get_mut<R>(&mut self, range: R) -> Result<&mut R::Output, Error>
    where
        R: SliceIndex<T>,
    {
        range.get_mut(self)
    }
}

/// A type that can be used to index a slice.
pub trait SliceIndex<T> {
    type Output: ?Sized;

    /// Get the element or subslice of `slice` at the position indicated by `self`.
    fn get(self, slice: &[T]) -> Result<&Self::Output, Error>;

    /// Get the mutable element or subslice of `slice` at the position
    /// indicated by `self`.
    fn get_mut(self, slice: &mut [T]) -> Result<&mut Self::Output, Error>;
}

// Support only `u32` indexing. This works on all 32-bit+ systems and is
// convenient since BIOS images use 32-bit addresses for everything.
// Care must be taken when calculating addresses as that might lead to overflows
// when using `u32`.

impl<T> SliceIndex<T> for Range<u32> {
    type Output = [T];

    fn get(self, slice: &[T]) -> Result<&[T], Error> {
        let len = slice.len();
        slice
            .get(self.start as usize..self.end as usize)
            .ok_or_else(|| out_of_bounds(self, len))
    }

    fn get_mut(self, slice: &mut [T]) -> Result<&mut [T], Error> {
        let len = slice.len();
        slice
            .get_mut(self.start as usize..self.end as usize)
            .ok_or_else(|| out_of_bounds(self, len))
    }
}

impl<T> SliceIndex<T> for RangeFrom<u32> {
    type Output = [T];

    fn get(self, slice: &[T]) -> Result<&[T], Error> {
        let len = slice.len();
        slice
            .get(self.start as usize..)
            .ok_or_else(|| out_of_bounds(self.start..len as u32, len))
    }

    fn get_mut(self, slice: &mut [T]) -> Result<&mut [T], Error> {
        let len = slice.len();
        slice
            .get_mut(self.start as usize..)
            .ok_or_else(|| out_of_bounds(self.start..len as u32, len))
    }
}

fn out_of_bounds(range: Range<u32>, len: usize) -> Error {
    Error::Malformed(format!(
        "pointer points outside BIOS image (range {}..{} out of bounds of slice with length {})",
        range.start, range.end, len
    ))
}

/// Wraps any value and suppresses its debug output when printed with `{:?}`.
pub struct NoDebug<T>(pub T);

impl<T> fmt::Debug for NoDebug<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(debug output omitted)")
    }
}

impl<T> Deref for NoDebug<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for NoDebug<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for NoDebug<T> {
    fn from(t: T) -> Self {
        NoDebug(t)
    }
}

/// 16-Byte symmetric key.
///
/// This struct exists to make the debug output nicer.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Key(pub [u8; 16]);

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
