//! Frame type, source color spaces and BMP encoding.

use image::{DynamicImage, ImageBuffer, ImageFormat, RgbImage};
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};

/// Serializes frame adjustment and frame encoding across the whole process.
static FRAME_LOCK: Mutex<()> = Mutex::new(());

/// Acquire the process-wide frame lock. A poisoned lock is still usable:
/// the guarded value is `()`, so there is no state to repair.
pub(crate) fn frame_lock() -> MutexGuard<'static, ()> {
    FRAME_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Declared color space of the bytes handed over by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    #[default]
    Rgb,
    Bgr,
    Rgba,
    /// Packed 3-channel YUV (4:4:4).
    Yuv,
    Gray,
}

impl ColorSpace {
    /// Map the integer code used by callers (0 = RGB, 1 = BGR, 2 = RGBA,
    /// 3 = YUV, 4 = Gray). Unknown codes mean "no conversion".
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Rgb),
            1 => Some(Self::Bgr),
            2 => Some(Self::Rgba),
            3 => Some(Self::Yuv),
            4 => Some(Self::Gray),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Rgb => 0,
            Self::Bgr => 1,
            Self::Rgba => 2,
            Self::Yuv => 3,
            Self::Gray => 4,
        }
    }

    /// Number of interleaved channels this color space is stored with.
    pub fn channels(self) -> u8 {
        match self {
            Self::Rgb | Self::Bgr | Self::Yuv => 3,
            Self::Rgba => 4,
            Self::Gray => 1,
        }
    }
}

/// A video frame: interleaved 8-bit pixels with 1–4 channels.
#[derive(Debug, Clone)]
pub struct Frame {
    image: DynamicImage,
}

impl Frame {
    /// Wrap raw interleaved pixel bytes.
    ///
    /// Extra trailing bytes are ignored; a short buffer is an error.
    pub fn from_raw(
        width: u32,
        height: u32,
        bytes_per_pixel: u8,
        mut data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * bytes_per_pixel as usize;
        let actual = data.len();
        if actual < expected {
            return Err(FrameError::InvalidLength { expected, actual });
        }
        data.truncate(expected);

        let image = match bytes_per_pixel {
            1 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            4 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
            other => return Err(FrameError::UnsupportedChannels(other)),
        }
        .ok_or(FrameError::InvalidLength { expected, actual })?;

        Ok(Self { image })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(image),
        }
    }

    /// A zero-sized frame.
    pub fn empty() -> Self {
        Self::from_rgb(RgbImage::new(0, 0))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// The frame as RGB, if it already is (i.e. after color conversion).
    pub fn as_rgb(&self) -> Option<&RgbImage> {
        self.image.as_rgb8()
    }

    pub fn as_rgb_mut(&mut self) -> Option<&mut RgbImage> {
        self.image.as_mut_rgb8()
    }

    /// The frame as RGB, converting when it is in another layout.
    pub fn to_rgb(&self) -> Cow<'_, RgbImage> {
        match self.image.as_rgb8() {
            Some(rgb) => Cow::Borrowed(rgb),
            None => Cow::Owned(self.image.to_rgb8()),
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub(crate) fn replace(&mut self, image: DynamicImage) {
        self.image = image;
    }

    /// Consume the frame, returning `(width, height, bytes_per_pixel, bytes)`.
    pub fn into_raw(self) -> (u32, u32, u8, Vec<u8>) {
        let width = self.width();
        let height = self.height();
        let channels = self.channels();
        (width, height, channels, self.image.into_bytes())
    }

    /// Encode the frame as a BMP byte buffer.
    ///
    /// An empty frame encodes to an empty buffer.
    pub fn encode_bmp(&self) -> Result<Vec<u8>, FrameError> {
        let _guard = frame_lock();
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let mut buf = Cursor::new(Vec::new());
        match &self.image {
            // BMP has no gray+alpha layout.
            DynamicImage::ImageLumaA8(_) => DynamicImage::ImageRgba8(self.image.to_rgba8())
                .write_to(&mut buf, ImageFormat::Bmp)?,
            image => image.write_to(&mut buf, ImageFormat::Bmp)?,
        }
        Ok(buf.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unsupported bytes per pixel: {0}")]
    UnsupportedChannels(u8),
    #[error("cannot convert {channels}-channel frame from {color_space:?}")]
    ChannelMismatch { color_space: ColorSpace, channels: u8 },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}
