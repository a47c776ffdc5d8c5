//! Describing data
//!
//! Collective calls describe their buffers as a count of elements of some `Datatype`. Creating
//! derived datatypes is left to the layer above this crate; the runtime core only needs the size
//! of each builtin type to compute message lengths and to interpret elements during local
//! reductions.
//!
//! A direct relationship between a Rust type and a builtin datatype is covered by the
//! `Equivalence` trait. Slices of such types can be viewed as raw bytes with [`as_bytes`] and
//! [`as_bytes_mut`], which is how the typed collective methods hand buffers to the schedule
//! engine.

use std::{mem, slice};

/// Datatype traits
pub mod traits {
    pub use super::Equivalence;
}

/// A builtin datatype
///
/// # Standard section(s)
///
/// 3.2.2
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// Uninterpreted bytes, `MPI_BYTE`
    Byte,
    /// `MPI_INT8_T`
    I8,
    /// `MPI_INT16_T`
    I16,
    /// `MPI_INT32_T`
    I32,
    /// `MPI_INT64_T`
    I64,
    /// `MPI_UINT8_T`
    U8,
    /// `MPI_UINT16_T`
    U16,
    /// `MPI_UINT32_T`
    U32,
    /// `MPI_UINT64_T`
    U64,
    /// `MPI_FLOAT`
    F32,
    /// `MPI_DOUBLE`
    F64,
}

impl Datatype {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Datatype::Byte | Datatype::I8 | Datatype::U8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }

    /// Whether elements of this type are floating point numbers.
    pub fn is_floating(self) -> bool {
        matches!(self, Datatype::F32 | Datatype::F64)
    }

    /// Number of bytes occupied by `count` elements.
    pub fn extent_of(self, count: usize) -> usize {
        self.size().saturating_mul(count)
    }
}

/// A direct equivalence exists between the implementing type and a builtin datatype
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value of `Self`, and the size
/// must equal `Self::DATATYPE.size()`. Received bytes are written straight into slices of
/// implementing types.
///
/// # Standard section(s)
///
/// 3.2.2
pub unsafe trait Equivalence: Copy + 'static {
    /// The builtin datatype that is equivalent to this Rust type
    const DATATYPE: Datatype;

    /// The builtin datatype that is equivalent to this Rust type
    fn equivalent_datatype() -> Datatype {
        Self::DATATYPE
    }
}

macro_rules! equivalent_system_datatype {
    ($rstype:ty, $dtype:expr) => {
        unsafe impl Equivalence for $rstype {
            const DATATYPE: Datatype = $dtype;
        }
    };
}

equivalent_system_datatype!(f32, Datatype::F32);
equivalent_system_datatype!(f64, Datatype::F64);

equivalent_system_datatype!(i8, Datatype::I8);
equivalent_system_datatype!(i16, Datatype::I16);
equivalent_system_datatype!(i32, Datatype::I32);
equivalent_system_datatype!(i64, Datatype::I64);

equivalent_system_datatype!(u8, Datatype::U8);
equivalent_system_datatype!(u16, Datatype::U16);
equivalent_system_datatype!(u32, Datatype::U32);
equivalent_system_datatype!(u64, Datatype::U64);

#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(usize, Datatype::U32);
#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(isize, Datatype::I32);

#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(usize, Datatype::U64);
#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(isize, Datatype::I64);

/// View a slice of equivalent values as its underlying bytes.
pub fn as_bytes<T: Equivalence>(buf: &[T]) -> &[u8] {
    // SAFETY: `Equivalence` types are plain data without padding; the byte length is the exact
    // size of the slice.
    unsafe { slice::from_raw_parts(buf.as_ptr() as *const u8, mem::size_of_val(buf)) }
}

/// View a mutable slice of equivalent values as its underlying bytes.
pub fn as_bytes_mut<T: Equivalence>(buf: &mut [T]) -> &mut [u8] {
    // SAFETY: as in `as_bytes`; additionally every bit pattern is a valid `T`, so arbitrary
    // received bytes leave the slice in a valid state.
    unsafe { slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, mem::size_of_val(buf)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_rust_types() {
        assert_eq!(i32::DATATYPE.size(), mem::size_of::<i32>());
        assert_eq!(f64::DATATYPE.size(), mem::size_of::<f64>());
        assert_eq!(u16::equivalent_datatype(), Datatype::U16);
        assert_eq!(usize::DATATYPE.size(), mem::size_of::<usize>());
        assert_eq!(Datatype::Byte.extent_of(10), 10);
        assert_eq!(Datatype::U64.extent_of(3), 24);
    }

    #[test]
    fn byte_views() {
        let mut v = [1u32, 2, 3];
        assert_eq!(as_bytes(&v).len(), 12);
        as_bytes_mut(&mut v)[..4].copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(v, [7, 2, 3]);
    }
}
