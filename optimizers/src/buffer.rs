use std::{fmt::Debug, ops::Range};

use comms::Precision;
use half::{bf16, f16};
use num_traits::Float;

use crate::{OptimErr, Result};

/// A numeric element type that can back a `Buffer`.
///
/// In-place buffer math goes through `num_traits::Float`. Update rules read elements
/// as `f64` and cast results back, so every pair of precisions can be cast too.
pub trait Element: Float + bytemuck::Pod + Debug + Send + Sync + 'static {
    const PRECISION: Precision;

    fn cast_from(value: f64) -> Self;

    fn as_f64(self) -> f64;

    fn view(buf: &Buffer) -> Option<&[Self]>;

    fn view_mut(buf: &mut Buffer) -> Option<&mut [Self]>;

    fn wrap(data: Box<[Self]>) -> Buffer;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $from:expr, $to:expr) => {
        impl Element for $t {
            const PRECISION: Precision = Precision::$variant;

            fn cast_from(value: f64) -> Self {
                ($from)(value)
            }

            fn as_f64(self) -> f64 {
                ($to)(self)
            }

            fn view(buf: &Buffer) -> Option<&[Self]> {
                match buf {
                    Buffer::$variant(data) => Some(&data[..]),
                    _ => None,
                }
            }

            fn view_mut(buf: &mut Buffer) -> Option<&mut [Self]> {
                match buf {
                    Buffer::$variant(data) => Some(&mut data[..]),
                    _ => None,
                }
            }

            fn wrap(data: Box<[Self]>) -> Buffer {
                Buffer::$variant(data)
            }
        }
    };
}

impl_element!(f16, Float16, f16::from_f64, f16::to_f64);
impl_element!(bf16, BFloat16, bf16::from_f64, bf16::to_f64);
impl_element!(f32, Float32, |v: f64| v as f32, |v: f32| v as f64);
impl_element!(f64, Float64, |v: f64| v, |v: f64| v);

/// Runs `$body` with `$t` bound to the element type of `$precision`.
macro_rules! with_element {
    ($precision:expr, $t:ident => $body:expr) => {
        match $precision {
            ::comms::Precision::Float16 => {
                type $t = ::half::f16;
                $body
            }
            ::comms::Precision::BFloat16 => {
                type $t = ::half::bf16;
                $body
            }
            ::comms::Precision::Float32 => {
                type $t = f32;
                $body
            }
            ::comms::Precision::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use with_element;

macro_rules! each_variant {
    ($buf:expr, $data:ident => $body:expr) => {
        match $buf {
            Buffer::Float16($data) => $body,
            Buffer::BFloat16($data) => $body,
            Buffer::Float32($data) => $body,
            Buffer::Float64($data) => $body,
        }
    };
}

/// A flat, device resident array of numbers, one variant per precision.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Float16(Box<[f16]>),
    BFloat16(Box<[bf16]>),
    Float32(Box<[f32]>),
    Float64(Box<[f64]>),
}

impl<T: Element> From<Vec<T>> for Buffer {
    fn from(data: Vec<T>) -> Self {
        T::wrap(data.into_boxed_slice())
    }
}

impl Buffer {
    /// Creates a new zero filled `Buffer`.
    ///
    /// # Arguments
    /// * `precision` - The element type of the buffer.
    /// * `len` - The amount of elements.
    pub fn zeros(precision: Precision, len: usize) -> Self {
        with_element!(precision, T => {
            T::wrap(vec![<T as num_traits::Zero>::zero(); len].into_boxed_slice())
        })
    }

    /// Creates a new `Buffer` out of raw element bytes.
    ///
    /// # Arguments
    /// * `precision` - The element type the bytes encode.
    /// * `bytes` - The raw bytes, its length must be a multiple of the element size.
    ///
    /// # Returns
    /// The decoded buffer or a `CorruptCheckpoint` error if `bytes` is cut in half of an element.
    pub fn from_bytes(precision: Precision, bytes: &[u8]) -> Result<Self> {
        let size = precision.size();

        if bytes.len() % size != 0 {
            return Err(OptimErr::CorruptCheckpoint(format!(
                "{} bytes is not a whole amount of {precision} elements",
                bytes.len()
            )));
        }

        with_element!(precision, T => {
            let mut data = vec![<T as num_traits::Zero>::zero(); bytes.len() / size];
            bytemuck::cast_slice_mut::<T, u8>(&mut data).copy_from_slice(bytes);
            Ok(T::wrap(data.into_boxed_slice()))
        })
    }

    pub fn precision(&self) -> Precision {
        match self {
            Self::Float16(_) => Precision::Float16,
            Self::BFloat16(_) => Precision::BFloat16,
            Self::Float32(_) => Precision::Float32,
            Self::Float64(_) => Precision::Float64,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw bytes of the elements.
    pub fn as_bytes(&self) -> &[u8] {
        each_variant!(self, data => bytemuck::cast_slice(&data[..]))
    }

    /// Returns the elements as a `T` slice.
    ///
    /// # Returns
    /// A `PrecisionMismatch` error if this buffer doesn't hold `T` elements.
    pub fn typed<T: Element>(&self) -> Result<&[T]> {
        T::view(self).ok_or(OptimErr::PrecisionMismatch {
            got: self.precision(),
            expected: T::PRECISION,
        })
    }

    /// Returns the elements as a mutable `T` slice.
    ///
    /// # Returns
    /// A `PrecisionMismatch` error if this buffer doesn't hold `T` elements.
    pub fn typed_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let got = self.precision();
        T::view_mut(self).ok_or(OptimErr::PrecisionMismatch {
            got,
            expected: T::PRECISION,
        })
    }

    /// Copies the elements out into a vector of `T`, casting them if needed.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        each_variant!(self, data => data.iter().map(|v| T::cast_from(v.as_f64())).collect())
    }

    /// Returns a copy of this buffer with its elements cast to `precision`.
    pub fn cast(&self, precision: Precision) -> Self {
        with_element!(precision, T => Self::from(self.to_vec::<T>()))
    }

    /// Overwrites every element with the element of `src` at the same position, casting them.
    ///
    /// # Returns
    /// A `SizeMismatch` error if both buffers don't have the same length.
    pub fn copy_cast_from(&mut self, src: &Buffer) -> Result<()> {
        if src.len() != self.len() {
            return Err(OptimErr::SizeMismatch {
                a: "source buffer",
                b: "destination buffer",
                got: src.len(),
                expected: self.len(),
            });
        }

        self.write_range(0, src)
    }

    /// Returns a copy of the elements inside `range`.
    pub fn read_range(&self, range: Range<usize>) -> Result<Self> {
        check_range(&range, self.len())?;
        Ok(each_variant!(self, data => boxed(&data[range])))
    }

    /// Copies `src` into the elements starting at `offset`, casting them if needed.
    pub fn write_range(&mut self, offset: usize, src: &Buffer) -> Result<()> {
        let range = offset..offset + src.len();
        check_range(&range, self.len())?;

        each_variant!(self, dst => each_variant!(src, data => cast_into(data, &mut dst[range])));
        Ok(())
    }

    /// Exchanges the elements starting at `offset` with every element of `other`.
    ///
    /// Both buffers must share the same precision, nothing is cast.
    pub fn swap_range(&mut self, offset: usize, other: &mut Buffer) -> Result<()> {
        let range = offset..offset + other.len();
        check_range(&range, self.len())?;

        with_element!(self.precision(), T => {
            let other = other.typed_mut::<T>()?;
            self.typed_mut::<T>()?[range].swap_with_slice(other);
        });

        Ok(())
    }

    /// Adds the elements of `src` starting at `offset` into this buffer, casting them if needed.
    pub fn add_range(&mut self, src: &Buffer, offset: usize) -> Result<()> {
        let range = offset..offset + self.len();
        check_range(&range, src.len())?;

        each_variant!(self, dst => each_variant!(src, data => add_into(&data[range], dst)));
        Ok(())
    }

    pub fn fill_zero(&mut self) {
        each_variant!(self, data => data.fill(num_traits::Zero::zero()))
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&mut self, factor: f64) {
        each_variant!(self, data => scale_slice(data, factor))
    }

    /// Clamps every element to `[-threshold, threshold]`.
    pub fn clamp(&mut self, threshold: f64) {
        each_variant!(self, data => clamp_slice(data, threshold))
    }

    /// Returns the L2 norm of the elements, accumulated in `f64`.
    pub fn l2_norm(&self) -> f64 {
        let sum: f64 = each_variant!(self, data => data.iter().map(|v| v.as_f64().powi(2)).sum());
        sum.sqrt()
    }
}

fn check_range(range: &Range<usize>, len: usize) -> Result<()> {
    if range.end > len {
        return Err(OptimErr::SizeMismatch {
            a: "range end",
            b: "buffer length",
            got: range.end,
            expected: len,
        });
    }

    Ok(())
}

fn boxed<T: Element>(data: &[T]) -> Buffer {
    T::wrap(data.into())
}

fn cast_into<S: Element, D: Element>(src: &[S], dst: &mut [D]) {
    dst.iter_mut()
        .zip(src)
        .for_each(|(d, s)| *d = D::cast_from(s.as_f64()));
}

fn add_into<S: Element, D: Element>(src: &[S], dst: &mut [D]) {
    dst.iter_mut()
        .zip(src)
        .for_each(|(d, s)| *d = *d + D::cast_from(s.as_f64()));
}

fn scale_slice<T: Element>(data: &mut [T], factor: f64) {
    data.iter_mut()
        .for_each(|v| *v = T::cast_from(v.as_f64() * factor));
}

fn clamp_slice<T: Element>(data: &mut [T], threshold: f64) {
    let t = T::cast_from(threshold);
    data.iter_mut()
        .for_each(|v| *v = Float::min(Float::max(*v, -t), t));
}
