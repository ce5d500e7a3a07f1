//! Fixed-width encoding of typed arrays carried inside messages.

use std::fmt;
use std::ops::AddAssign;

use crate::utils::ParasyncError;

use bytes::{BufMut, Bytes, BytesMut};

/// Explicit conversion between a slice of typed values and raw bytes.
pub trait Codec: Sized {
    /// Encoded width of one value in bytes.
    const WIDTH: usize;

    /// Encodes a slice of values into a contiguous buffer.
    fn encode(vals: &[Self]) -> Bytes;

    /// Decodes a buffer back into values. Fails if the buffer length is not
    /// a multiple of `WIDTH`.
    fn decode(buf: &[u8]) -> Result<Vec<Self>, ParasyncError>;
}

macro_rules! impl_codec_le {
    ($($ty:ty),+) => {
        $(
            impl Codec for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn encode(vals: &[Self]) -> Bytes {
                    let mut buf =
                        BytesMut::with_capacity(vals.len() * Self::WIDTH);
                    for v in vals {
                        buf.put_slice(&v.to_le_bytes());
                    }
                    buf.freeze()
                }

                fn decode(buf: &[u8]) -> Result<Vec<Self>, ParasyncError> {
                    if buf.len() % Self::WIDTH != 0 {
                        return Err(ParasyncError::msg(format!(
                            "buffer length {} not a multiple of {} for {}",
                            buf.len(),
                            Self::WIDTH,
                            stringify!($ty)
                        )));
                    }
                    Ok(buf
                        .chunks_exact(Self::WIDTH)
                        .map(|chunk| {
                            let mut raw = [0u8; std::mem::size_of::<$ty>()];
                            raw.copy_from_slice(chunk);
                            <$ty>::from_le_bytes(raw)
                        })
                        .collect())
                }
            }
        )+
    };
}

impl_codec_le!(u32, u64, i32, i64, f32, f64);

/// Value type that a parameter table can hold.
pub trait Value:
    Codec
    + Copy
    + Default
    + AddAssign
    + PartialEq
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> Value for T where
    T: Codec
        + Copy
        + Default
        + AddAssign
        + PartialEq
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}
