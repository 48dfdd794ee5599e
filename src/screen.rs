//! Screen frame descriptors shared by the screen-streaming receivers.

/// Pixel layout of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureFormat {
    /// 1 bit per pixel, row-major, most significant bit first.
    Mono,
    /// 1 bit per pixel in the CAS40 screenshot ordering.
    MonoCas,
    /// Two 1-bit layers, light then dark.
    MonoDual,
    /// Three 1-bit sheets, each prefixed by a colour code byte.
    TripleCas,
    /// 4 bits per pixel RGB, two pixels per byte.
    Rgb4BitPacked,
    /// 16 bits per pixel, R5G6B5.
    R5G6B5,
}

impl PictureFormat {
    /// Expected payload size for a streamed frame of the given dimensions.
    ///
    /// Only defined for the formats that appear in Protocol 7.00
    /// screen-streaming; the CAS40 sheet formats size their payloads from
    /// the header instead.
    pub(crate) fn frame_size(self, width: usize, height: usize) -> Option<usize> {
        let row = (width >> 3) + usize::from(width & 7 != 0);
        match self {
            PictureFormat::Mono => Some(row * height),
            PictureFormat::MonoDual => Some(row * height * 2),
            PictureFormat::Rgb4BitPacked => Some((width * height + 1) >> 1),
            PictureFormat::R5G6B5 => Some(width * height * 2),
            PictureFormat::MonoCas | PictureFormat::TripleCas => None,
        }
    }
}

/// One received screen frame. The pixel data borrows the link's scratch
/// buffer and is only valid for the duration of the callback.
#[derive(Debug)]
pub struct Frame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PictureFormat,
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_match_the_wire_formats() {
        assert_eq!(PictureFormat::Mono.frame_size(128, 64), Some(1024));
        assert_eq!(PictureFormat::MonoDual.frame_size(128, 64), Some(2048));
        assert_eq!(PictureFormat::Rgb4BitPacked.frame_size(396, 224), Some(44352));
        assert_eq!(PictureFormat::R5G6B5.frame_size(396, 224), Some(177408));
        // Widths that are not a multiple of 8 round up to whole bytes.
        assert_eq!(PictureFormat::Mono.frame_size(127, 64), Some(1024));
        assert_eq!(PictureFormat::Rgb4BitPacked.frame_size(3, 3), Some(5));
    }
}
