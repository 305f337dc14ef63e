//! Element-type conversions between buffer chunks.
//!
//! Real↔real conversions use C-style value casts. Complex↔complex converts
//! re and im independently. Real→complex zero-fills the imaginary part.
//! Complex→real and custom element types have no conversion path.

use super::BufferChunk;
use crate::dtype::{Dtype, Scalar};
use crate::{Error, Result};

/// A scalar that can value-cast itself into every other scalar kind.
trait Cast: Copy {
    fn to_i8(self) -> i8;
    fn to_i16(self) -> i16;
    fn to_i32(self) -> i32;
    fn to_i64(self) -> i64;
    fn to_u8(self) -> u8;
    fn to_u16(self) -> u16;
    fn to_u32(self) -> u32;
    fn to_u64(self) -> u64;
    fn to_f32(self) -> f32;
    fn to_f64(self) -> f64;
}

macro_rules! impl_cast {
    ($($ty:ty),*) => {$(
        impl Cast for $ty {
            fn to_i8(self) -> i8 { self as i8 }
            fn to_i16(self) -> i16 { self as i16 }
            fn to_i32(self) -> i32 { self as i32 }
            fn to_i64(self) -> i64 { self as i64 }
            fn to_u8(self) -> u8 { self as u8 }
            fn to_u16(self) -> u16 { self as u16 }
            fn to_u32(self) -> u32 { self as u32 }
            fn to_u64(self) -> u64 { self as u64 }
            fn to_f32(self) -> f32 { self as f32 }
            fn to_f64(self) -> f64 { self as f64 }
        }
    )*};
}

impl_cast!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// Copy `count` scalars from `src` into `dst` through a cast. Unaligned
/// reads/writes keep this correct for chunks at arbitrary byte offsets.
unsafe fn cast_scalars<S: Cast, D: Copy>(
    src: *const u8,
    dst: *mut u8,
    count: usize,
    cast: impl Fn(S) -> D,
) {
    let src = src as *const S;
    let dst = dst as *mut D;
    for i in 0..count {
        let value = std::ptr::read_unaligned(src.add(i));
        std::ptr::write_unaligned(dst.add(i), cast(value));
    }
}

/// Dispatch on the destination scalar for a known source scalar.
unsafe fn cast_to_scalar<S: Cast>(src: *const u8, dst: *mut u8, count: usize, to: Scalar) {
    match to {
        Scalar::I8 => cast_scalars::<S, i8>(src, dst, count, Cast::to_i8),
        Scalar::I16 => cast_scalars::<S, i16>(src, dst, count, Cast::to_i16),
        Scalar::I32 => cast_scalars::<S, i32>(src, dst, count, Cast::to_i32),
        Scalar::I64 => cast_scalars::<S, i64>(src, dst, count, Cast::to_i64),
        Scalar::U8 => cast_scalars::<S, u8>(src, dst, count, Cast::to_u8),
        Scalar::U16 => cast_scalars::<S, u16>(src, dst, count, Cast::to_u16),
        Scalar::U32 => cast_scalars::<S, u32>(src, dst, count, Cast::to_u32),
        Scalar::U64 => cast_scalars::<S, u64>(src, dst, count, Cast::to_u64),
        Scalar::F32 => cast_scalars::<S, f32>(src, dst, count, Cast::to_f32),
        Scalar::F64 => cast_scalars::<S, f64>(src, dst, count, Cast::to_f64),
        Scalar::Custom(_) => unreachable!("custom scalars are rejected before dispatch"),
    }
}

/// Strided variant used to pack/unpack complex interleaving. Copies
/// `count` scalars reading every `src_stride`-th element and writing every
/// `dst_stride`-th slot, starting at the given scalar offsets.
unsafe fn cast_strided<S: Cast>(
    src: *const u8,
    src_offset: usize,
    src_stride: usize,
    dst: *mut u8,
    dst_offset: usize,
    dst_stride: usize,
    count: usize,
    to: Scalar,
) {
    macro_rules! run {
        ($dst_ty:ty, $cast:expr) => {{
            let src = (src as *const S).add(src_offset);
            let dst = (dst as *mut $dst_ty).add(dst_offset);
            for i in 0..count {
                let value = std::ptr::read_unaligned(src.add(i * src_stride));
                std::ptr::write_unaligned(dst.add(i * dst_stride), $cast(value));
            }
        }};
    }
    match to {
        Scalar::I8 => run!(i8, Cast::to_i8),
        Scalar::I16 => run!(i16, Cast::to_i16),
        Scalar::I32 => run!(i32, Cast::to_i32),
        Scalar::I64 => run!(i64, Cast::to_i64),
        Scalar::U8 => run!(u8, Cast::to_u8),
        Scalar::U16 => run!(u16, Cast::to_u16),
        Scalar::U32 => run!(u32, Cast::to_u32),
        Scalar::U64 => run!(u64, Cast::to_u64),
        Scalar::F32 => run!(f32, Cast::to_f32),
        Scalar::F64 => run!(f64, Cast::to_f64),
        Scalar::Custom(_) => unreachable!("custom scalars are rejected before dispatch"),
    }
}

/// Dispatch on the source scalar.
unsafe fn cast_any(src: *const u8, from: Scalar, dst: *mut u8, to: Scalar, count: usize) {
    match from {
        Scalar::I8 => cast_to_scalar::<i8>(src, dst, count, to),
        Scalar::I16 => cast_to_scalar::<i16>(src, dst, count, to),
        Scalar::I32 => cast_to_scalar::<i32>(src, dst, count, to),
        Scalar::I64 => cast_to_scalar::<i64>(src, dst, count, to),
        Scalar::U8 => cast_to_scalar::<u8>(src, dst, count, to),
        Scalar::U16 => cast_to_scalar::<u16>(src, dst, count, to),
        Scalar::U32 => cast_to_scalar::<u32>(src, dst, count, to),
        Scalar::U64 => cast_to_scalar::<u64>(src, dst, count, to),
        Scalar::F32 => cast_to_scalar::<f32>(src, dst, count, to),
        Scalar::F64 => cast_to_scalar::<f64>(src, dst, count, to),
        Scalar::Custom(_) => unreachable!("custom scalars are rejected before dispatch"),
    }
}

unsafe fn cast_any_strided(
    src: *const u8,
    from: Scalar,
    src_offset: usize,
    src_stride: usize,
    dst: *mut u8,
    to: Scalar,
    dst_offset: usize,
    dst_stride: usize,
    count: usize,
) {
    macro_rules! dispatch_src {
        ($($scalar:ident => $ty:ty),*) => {
            match from {
                $(Scalar::$scalar => cast_strided::<$ty>(
                    src, src_offset, src_stride, dst, dst_offset, dst_stride, count, to,
                ),)*
                Scalar::Custom(_) => unreachable!("custom scalars are rejected before dispatch"),
            }
        };
    }
    dispatch_src!(
        I8 => i8, I16 => i16, I32 => i32, I64 => i64,
        U8 => u8, U16 => u16, U32 => u32, U64 => u64,
        F32 => f32, F64 => f64
    )
}

fn check_convertible(from: Dtype, to: Dtype) -> Result<()> {
    if matches!(from.scalar(), Scalar::Custom(_)) || matches!(to.scalar(), Scalar::Custom(_)) {
        return Err(Error::BufferConvert(format!(
            "no conversion path {} -> {}",
            from, to
        )));
    }
    Ok(())
}

pub(crate) fn convert(chunk: &BufferChunk, to: Dtype, num_elements: usize) -> Result<BufferChunk> {
    let from = chunk.dtype();
    check_convertible(from, to)?;
    if num_elements > chunk.elements() {
        return Err(Error::BufferConvert(format!(
            "requested {} elements, chunk holds {}",
            num_elements,
            chunk.elements()
        )));
    }

    let mut out = BufferChunk::alloc(to, num_elements)?;
    let src = chunk.address as *const u8;
    let dst = out.address as *mut u8;

    match (from.is_complex(), to.is_complex()) {
        (false, false) => unsafe {
            cast_any(src, from.scalar(), dst, to.scalar(), num_elements);
        },
        (true, true) => unsafe {
            // re and im convert independently; interleaved layout means a
            // plain scalar pass over 2n values does exactly that
            cast_any(src, from.scalar(), dst, to.scalar(), num_elements * 2);
        },
        (false, true) => unsafe {
            out.as_mut_slice().fill(0);
            cast_any_strided(src, from.scalar(), 0, 1, dst, to.scalar(), 0, 2, num_elements);
        },
        (true, false) => {
            return Err(Error::BufferConvert(format!(
                "no conversion path {} -> {}",
                from, to
            )));
        }
    }
    Ok(out)
}

pub(crate) fn convert_complex(
    chunk: &BufferChunk,
    to: Dtype,
    num_elements: usize,
) -> Result<(BufferChunk, BufferChunk)> {
    let from = chunk.dtype();
    check_convertible(from, to)?;
    if to.is_complex() {
        return Err(Error::BufferConvert(
            "convert_complex target must be a real scalar type".into(),
        ));
    }
    if num_elements > chunk.elements() {
        return Err(Error::BufferConvert(format!(
            "requested {} elements, chunk holds {}",
            num_elements,
            chunk.elements()
        )));
    }

    let mut re = BufferChunk::alloc(to, num_elements)?;
    let mut im = BufferChunk::alloc(to, num_elements)?;
    let src = chunk.address as *const u8;

    if from.is_complex() {
        unsafe {
            cast_any_strided(
                src,
                from.scalar(),
                0,
                2,
                re.address as *mut u8,
                to.scalar(),
                0,
                1,
                num_elements,
            );
            cast_any_strided(
                src,
                from.scalar(),
                1,
                2,
                im.address as *mut u8,
                to.scalar(),
                0,
                1,
                num_elements,
            );
        }
    } else {
        unsafe {
            cast_any(src, from.scalar(), re.address as *mut u8, to.scalar(), num_elements);
        }
        im.as_mut_slice().fill(0);
    }
    Ok((re, im))
}

#[cfg(test)]
mod tests {
    use crate::{BufferChunk, Dtype, Scalar};

    fn int32_chunk(values: &[i32]) -> BufferChunk {
        let mut chunk = BufferChunk::alloc(Dtype::new(Scalar::I32), values.len()).unwrap();
        chunk.as_typed_mut::<i32>().copy_from_slice(values);
        chunk
    }

    #[test]
    fn real_to_real() {
        let chunk = int32_chunk(&[-2, -1, 0, 1, 2]);
        let out = chunk.convert(Dtype::new(Scalar::F32), 5).unwrap();
        assert_eq!(out.as_typed::<f32>(), &[-2.0, -1.0, 0.0, 1.0, 2.0]);

        let back = out.convert(Dtype::new(Scalar::I32), 5).unwrap();
        assert_eq!(back.as_typed::<i32>(), &[-2, -1, 0, 1, 2]);
    }

    #[test]
    fn narrowing_is_c_style() {
        let chunk = int32_chunk(&[300, -1]);
        let out = chunk.convert(Dtype::new(Scalar::U8), 2).unwrap();
        assert_eq!(out.as_typed::<u8>(), &[44, 255]);
    }

    #[test]
    fn complex_to_complex_converts_both_parts() {
        let mut chunk = BufferChunk::alloc(Dtype::complex(Scalar::F32).unwrap(), 2).unwrap();
        chunk
            .as_typed_mut::<f32>()
            .copy_from_slice(&[1.0, -1.0, 2.5, -2.5]);
        let out = chunk.convert(Dtype::complex(Scalar::F64).unwrap(), 2).unwrap();
        assert_eq!(out.as_typed::<f64>(), &[1.0, -1.0, 2.5, -2.5]);
    }

    #[test]
    fn real_to_complex_zero_fills_imag() {
        let chunk = int32_chunk(&[3, 4]);
        let out = chunk.convert(Dtype::complex(Scalar::F32).unwrap(), 2).unwrap();
        assert_eq!(out.as_typed::<f32>(), &[3.0, 0.0, 4.0, 0.0]);
    }

    #[test]
    fn complex_to_real_is_refused() {
        let chunk = BufferChunk::alloc(Dtype::complex(Scalar::F32).unwrap(), 2).unwrap();
        assert!(chunk.convert(Dtype::new(Scalar::F32), 2).is_err());
    }

    #[test]
    fn custom_has_no_path() {
        let chunk = BufferChunk::alloc(Dtype::new(Scalar::Custom(3)), 2).unwrap();
        assert!(chunk.convert(Dtype::new(Scalar::U8), 2).is_err());
    }

    #[test]
    fn split_complex_pair() {
        let mut chunk = BufferChunk::alloc(Dtype::complex(Scalar::F32).unwrap(), 3).unwrap();
        chunk
            .as_typed_mut::<f32>()
            .copy_from_slice(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
        let (re, im) = chunk
            .convert_complex(Dtype::new(Scalar::F64), 3)
            .unwrap();
        assert_eq!(re.as_typed::<f64>(), &[1.0, 2.0, 3.0]);
        assert_eq!(im.as_typed::<f64>(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn split_real_input_zero_imag() {
        let chunk = int32_chunk(&[7, 8]);
        let (re, im) = chunk.convert_complex(Dtype::new(Scalar::F32), 2).unwrap();
        assert_eq!(re.as_typed::<f32>(), &[7.0, 8.0]);
        assert_eq!(im.as_typed::<f32>(), &[0.0, 0.0]);
    }
}
