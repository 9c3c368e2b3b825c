//! Stride-aware BGRA to packed RGB conversion.
use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::ParallelSliceMut;

use crate::backend::Surface;

/// Bytes per pixel of the duplicated surface.
pub const SOURCE_BYTES_PER_PIXEL: usize = 4;
/// Bytes per pixel of the delivered frame.
pub const RGB_BYTES_PER_PIXEL: usize = 3;

#[derive(thiserror::Error, Eq, PartialEq, Clone, Copy, Debug)]
pub enum ConvertError {
    #[error("Row pitch {row_pitch} is smaller than a row of {width} pixels")]
    RowPitchTooSmall { row_pitch: usize, width: usize },
    #[error("Source buffer holds {actual} bytes but {expected} are required")]
    SourceTooSmall { expected: usize, actual: usize },
    #[error("Destination buffer holds {actual} bytes but exactly {expected} are required")]
    DestinationSize { expected: usize, actual: usize },
}

/// Converts a `B, G, R, A` surface into tightly packed `R, G, B` bytes.
///
/// Source rows start every `row_pitch` bytes, which may be larger than `width * 4` when
/// the driver pads rows for alignment. `dst` must be exactly `width * height * 3` bytes.
///
/// # Errors
///
/// Returns a [`ConvertError`] when the pitch or either buffer is too small for the
/// requested geometry; `dst` is left untouched in that case.
pub fn bgra_to_rgb(
    src: &[u8],
    width: usize,
    height: usize,
    row_pitch: usize,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    let src_row_len = width * SOURCE_BYTES_PER_PIXEL;
    let dst_row_len = width * RGB_BYTES_PER_PIXEL;

    if row_pitch < src_row_len {
        return Err(ConvertError::RowPitchTooSmall { row_pitch, width });
    }

    let expected_dst = dst_row_len * height;
    if dst.len() != expected_dst {
        return Err(ConvertError::DestinationSize { expected: expected_dst, actual: dst.len() });
    }

    // The last row only needs its pixels, not its padding.
    let expected_src = if height == 0 { 0 } else { row_pitch * (height - 1) + src_row_len };
    if src.len() < expected_src {
        return Err(ConvertError::SourceTooSmall { expected: expected_src, actual: src.len() });
    }

    if width == 0 || height == 0 {
        return Ok(());
    }

    dst.par_chunks_exact_mut(dst_row_len).enumerate().for_each(|(y, dst_row)| {
        let start = y * row_pitch;
        let src_row = &src[start..start + src_row_len];

        for (rgb, bgra) in dst_row
            .chunks_exact_mut(RGB_BYTES_PER_PIXEL)
            .zip(src_row.chunks_exact(SOURCE_BYTES_PER_PIXEL))
        {
            rgb[0] = bgra[2];
            rgb[1] = bgra[1];
            rgb[2] = bgra[0];
        }
    });

    Ok(())
}

/// Converts a mapped [`Surface`] into `dst`.
///
/// # Errors
///
/// See [`bgra_to_rgb`].
#[inline]
pub fn surface_to_rgb(surface: &Surface<'_>, dst: &mut [u8]) -> Result<(), ConvertError> {
    bgra_to_rgb(
        surface.data,
        surface.width as usize,
        surface.height as usize,
        surface.row_pitch as usize,
        dst,
    )
}
