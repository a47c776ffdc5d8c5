//! Built-in reduction operations applied by local-reduce schedule steps.

use crate::datatype::Datatype;
use crate::error::{Error, Result};

/// A built-in operation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SystemOperation {
    /// Sum
    Sum,
    /// Product
    Product,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Bitwise and
    BitAnd,
    /// Bitwise or
    BitOr,
    /// Bitwise xor
    BitXor,
}

impl SystemOperation {
    /// Whether the operation is defined on `datatype`.
    pub fn supports(self, datatype: Datatype) -> bool {
        match self {
            SystemOperation::Sum
            | SystemOperation::Product
            | SystemOperation::Min
            | SystemOperation::Max => datatype != Datatype::Byte,
            SystemOperation::BitAnd | SystemOperation::BitOr | SystemOperation::BitXor => {
                !datatype.is_floating()
            }
        }
    }

    /// Combine `input` into `inout` element-wise: `inout[i] = input[i] op inout[i]`.
    ///
    /// Both regions must have the same length, a multiple of the datatype size.
    pub fn apply(self, datatype: Datatype, input: &[u8], inout: &mut [u8]) -> Result<()> {
        if !self.supports(datatype) {
            return Err(Error::NotApplicable {
                algorithm: "local reduce",
                reason: format!("{:?} is not defined on {:?}", self, datatype),
            });
        }
        if input.len() != inout.len() || inout.len() % datatype.size() != 0 {
            return Err(Error::BufferTooSmall {
                needed: input.len(),
                actual: inout.len(),
            });
        }

        macro_rules! arith {
            ($t:ty, $n:literal) => {
                combine::<$t, $n>(input, inout, |a, b| match self {
                    SystemOperation::Sum => a + b,
                    SystemOperation::Product => a * b,
                    SystemOperation::Min => if a < b { a } else { b },
                    SystemOperation::Max => if a > b { a } else { b },
                    _ => unreachable!("bitwise operation on floating type"),
                })
            };
        }
        macro_rules! integer {
            ($t:ty, $n:literal) => {
                combine::<$t, $n>(input, inout, |a, b| match self {
                    SystemOperation::Sum => a.wrapping_add(b),
                    SystemOperation::Product => a.wrapping_mul(b),
                    SystemOperation::Min => a.min(b),
                    SystemOperation::Max => a.max(b),
                    SystemOperation::BitAnd => a & b,
                    SystemOperation::BitOr => a | b,
                    SystemOperation::BitXor => a ^ b,
                })
            };
        }

        match datatype {
            Datatype::Byte | Datatype::U8 => integer!(u8, 1),
            Datatype::I8 => integer!(i8, 1),
            Datatype::I16 => integer!(i16, 2),
            Datatype::I32 => integer!(i32, 4),
            Datatype::I64 => integer!(i64, 8),
            Datatype::U16 => integer!(u16, 2),
            Datatype::U32 => integer!(u32, 4),
            Datatype::U64 => integer!(u64, 8),
            Datatype::F32 => arith!(f32, 4),
            Datatype::F64 => arith!(f64, 8),
        }
        Ok(())
    }
}

trait FromNe<const N: usize>: Sized {
    fn from_ne(bytes: [u8; N]) -> Self;
    fn to_ne(self) -> [u8; N];
}

macro_rules! from_ne {
    ($($t:ty => $n:literal),*) => {
        $(impl FromNe<$n> for $t {
            fn from_ne(bytes: [u8; $n]) -> Self {
                <$t>::from_ne_bytes(bytes)
            }

            fn to_ne(self) -> [u8; $n] {
                self.to_ne_bytes()
            }
        })*
    };
}

from_ne!(u8 => 1, i8 => 1, i16 => 2, i32 => 4, i64 => 8, u16 => 2, u32 => 4, u64 => 8, f32 => 4, f64 => 8);

fn combine<T, const N: usize>(input: &[u8], inout: &mut [u8], f: impl Fn(T, T) -> T)
where
    T: FromNe<N>,
{
    for (a, b) in input.chunks_exact(N).zip(inout.chunks_exact_mut(N)) {
        let mut ab = [0u8; N];
        let mut bb = [0u8; N];
        ab.copy_from_slice(a);
        bb.copy_from_slice(b);
        b.copy_from_slice(&f(T::from_ne(ab), T::from_ne(bb)).to_ne());
    }
}
