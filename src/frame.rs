use serde::{Deserialize, Serialize};

use crate::error::LoopError;

/// Represents a single image frame.
///
/// Frames are immutable once captured. Image sources hand them out as
/// `Arc<Frame>` so the live-view pipeline and the acquisition worker can share the
/// same buffer without copying.
///
/// # Storage
/// Pixels are stored row-major as 16-bit values (`Vec<u16>`), which covers the
/// 8/12/16-bit sensors used for single-molecule imaging.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Length of one pixel side in micrometers
    pub pixel_size_um: f64,

    /// Acquisition time in milliseconds
    pub timestamp_ms: u64,

    /// Sequence number assigned by the image source
    pub frame_number: u64,

    /// Raw pixel data, row-major
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    ///
    /// The caller must ensure `pixels.len() == width * height`; use
    /// [`Frame::validate`] when the buffer comes from an untrusted source.
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        Self {
            width,
            height,
            pixel_size_um: 1.0,
            timestamp_ms: 0,
            frame_number: 0,
            pixels,
        }
    }

    /// Create a frame filled with a constant value.
    pub fn filled(width: u32, height: u32, value: u16) -> Self {
        Self::new(width, height, vec![value; width as usize * height as usize])
    }

    /// Set the physical pixel size.
    pub fn with_pixel_size(mut self, pixel_size_um: f64) -> Self {
        self.pixel_size_um = pixel_size_um;
        self
    }

    /// Set the acquisition timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Set the frame sequence number.
    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    /// Check that the buffer length matches the frame dimensions.
    pub fn validate(&self) -> Result<(), LoopError> {
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            return Err(LoopError::FrameProcessing(format!(
                "frame {} has {} pixels, expected {}x{} = {}",
                self.frame_number,
                self.pixels.len(),
                self.width,
                self.height,
                expected
            )));
        }
        Ok(())
    }

    /// Get pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    /// Imaged area in square micrometers.
    pub fn area_um2(&self) -> f64 {
        self.width as f64 * self.height as f64 * self.pixel_size_um * self.pixel_size_um
    }

    /// Copy out the region of interest.
    ///
    /// The ROI is clipped to the frame. An ROI that does not overlap the frame at
    /// all is a frame-level error. Metadata (pixel size, timestamp, frame number)
    /// is carried over.
    pub fn crop(&self, roi: &Roi) -> Result<Frame, LoopError> {
        self.validate()?;

        let x0 = roi.x.min(self.width);
        let y0 = roi.y.min(self.height);
        let x1 = roi.x.saturating_add(roi.width).min(self.width);
        let y1 = roi.y.saturating_add(roi.height).min(self.height);

        if x1 <= x0 || y1 <= y0 {
            return Err(LoopError::FrameProcessing(format!(
                "ROI {}x{}+{}+{} lies outside {}x{} frame {}",
                roi.width, roi.height, roi.x, roi.y, self.width, self.height, self.frame_number
            )));
        }

        let width = x1 - x0;
        let height = y1 - y0;
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for row in y0..y1 {
            let start = row as usize * self.width as usize + x0 as usize;
            pixels.extend_from_slice(&self.pixels[start..start + width as usize]);
        }

        Ok(Frame {
            width,
            height,
            pixel_size_um: self.pixel_size_um,
            timestamp_ms: self.timestamp_ms,
            frame_number: self.frame_number,
            pixels,
        })
    }
}

/// Rectangular region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge (inclusive)
    pub x: u32,
    /// Top edge (inclusive)
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Roi {
    /// Create a new ROI.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> Frame {
        let pixels = (0..width * height).map(|i| i as u16).collect();
        Frame::new(width, height, pixels)
    }

    #[test]
    fn crop_copies_requested_rows() {
        let frame = ramp(4, 4).with_frame_number(7).with_pixel_size(0.1);
        let cropped = frame.crop(&Roi::new(1, 1, 2, 2)).unwrap();

        assert_eq!((cropped.width, cropped.height), (2, 2));
        assert_eq!(cropped.pixels, vec![5, 6, 9, 10]);
        assert_eq!(cropped.frame_number, 7);
        assert_eq!(cropped.pixel_size_um, 0.1);
    }

    #[test]
    fn crop_clips_to_frame() {
        let frame = ramp(4, 4);
        let cropped = frame.crop(&Roi::new(3, 2, 10, 10)).unwrap();
        assert_eq!((cropped.width, cropped.height), (1, 2));
        assert_eq!(cropped.pixels, vec![11, 15]);
    }

    #[test]
    fn crop_outside_frame_is_error() {
        let frame = ramp(4, 4);
        let err = frame.crop(&Roi::new(8, 8, 2, 2)).unwrap_err();
        assert!(matches!(err, LoopError::FrameProcessing(_)));
    }

    #[test]
    fn validate_rejects_short_buffer() {
        let frame = Frame::new(4, 4, vec![0; 3]);
        assert!(frame.validate().is_err());
        assert!(frame.crop(&Roi::new(0, 0, 1, 1)).is_err());
    }

    #[test]
    fn area_uses_pixel_size() {
        let frame = Frame::filled(10, 20, 0).with_pixel_size(0.5);
        assert!((frame.area_um2() - 50.0).abs() < 1e-12);
        assert_eq!(frame.get(9, 19), Some(0));
        assert_eq!(frame.get(10, 0), None);
    }
}
