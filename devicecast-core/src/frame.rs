//! Frame source boundary
//!
//! The frame source is the device driver side of the system: it owns the
//! capture pipelines and exposes the most recent frame and metadata per stream.
//! Everything here is read-only from the core's point of view. Implementations
//! are allowed to block, so the core only ever calls them from
//! `tokio::task::spawn_blocking`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::types::{DeviceId, StreamType};

/// Typed failure reported by the frame source, carrying an HTTP-like status code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{detail} (status {status_code})")]
pub struct FrameSourceError {
    pub status_code: u16,
    pub detail: String,
}

impl FrameSourceError {
    pub fn new(status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            status_code,
            detail: detail.into(),
        }
    }
}

/// Streaming status of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub active_streams: BTreeSet<StreamType>,
}

impl StreamStatus {
    #[must_use]
    pub fn is_active(&self, stream_type: &StreamType) -> bool {
        self.is_streaming && self.active_streams.contains(stream_type)
    }
}

/// Memory layout of a frame's pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Gray8,
}

impl PixelLayout {
    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgb24 | Self::Bgr24 => 3,
            Self::Rgba32 | Self::Bgra32 => 4,
            Self::Gray8 => 1,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Rgba32 => "rgba32",
            Self::Bgra32 => "bgra32",
            Self::Gray8 => "gray8",
        }
    }

    const fn is_blue_first(&self) -> bool {
        matches!(self, Self::Bgr24 | Self::Bgra32)
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rgb24" | "rgb8" => Ok(Self::Rgb24),
            "bgr24" | "bgr8" => Ok(Self::Bgr24),
            "rgba32" | "rgba8" => Ok(Self::Rgba32),
            "bgra32" | "bgra8" => Ok(Self::Bgra32),
            "gray8" | "y8" => Ok(Self::Gray8),
            other => Err(format!("Unknown pixel layout: {other}")),
        }
    }
}

/// A raw video frame as produced by the frame source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Bytes,
}

impl Frame {
    /// A black frame of the given size
    #[must_use]
    pub fn blank(width: u32, height: u32, layout: PixelLayout) -> Self {
        let len = width as usize * height as usize * layout.bytes_per_pixel();
        Self {
            width,
            height,
            layout,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }

    /// Convert the frame to `target`, passing it through untouched when the
    /// layout already matches.
    pub fn into_layout(self, target: PixelLayout) -> Result<Self, FrameSourceError> {
        if self.data.len() != self.expected_len() {
            return Err(FrameSourceError::new(
                500,
                format!(
                    "Frame buffer holds {} bytes, expected {} for {}x{} {}",
                    self.data.len(),
                    self.expected_len(),
                    self.width,
                    self.height,
                    self.layout
                ),
            ));
        }
        if self.layout == target {
            return Ok(self);
        }

        let src_bpp = self.layout.bytes_per_pixel();
        let dst_bpp = target.bytes_per_pixel();
        let pixels = self.width as usize * self.height as usize;
        let mut out = Vec::with_capacity(pixels * dst_bpp);

        for px in self.data.chunks_exact(src_bpp) {
            // Normalize to (r, g, b, a)
            let (r, g, b, a) = match self.layout {
                PixelLayout::Gray8 => (px[0], px[0], px[0], u8::MAX),
                PixelLayout::Rgb24 => (px[0], px[1], px[2], u8::MAX),
                PixelLayout::Bgr24 => (px[2], px[1], px[0], u8::MAX),
                PixelLayout::Rgba32 => (px[0], px[1], px[2], px[3]),
                PixelLayout::Bgra32 => (px[2], px[1], px[0], px[3]),
            };
            match target {
                PixelLayout::Gray8 => {
                    // ITU-R BT.601 luma
                    let luma = (u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000;
                    out.push(luma as u8);
                }
                _ => {
                    if target.is_blue_first() {
                        out.extend_from_slice(&[b, g, r]);
                    } else {
                        out.extend_from_slice(&[r, g, b]);
                    }
                    if dst_bpp == 4 {
                        out.push(a);
                    }
                }
            }
        }

        Ok(Self {
            width: self.width,
            height: self.height,
            layout: target,
            data: Bytes::from(out),
        })
    }
}

/// Three-axis motion sample from an IMU stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionData {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Point cloud computed from a depth frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    /// xyz vertices in meters
    pub vertices: Vec<[f32; 3]>,
    /// uv texture coordinates
    pub texture_coordinates: Vec<[f32; 2]>,
}

/// Metadata accompanying the latest frame of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    /// Device timestamp in milliseconds
    pub timestamp: f64,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub motion_data: Option<MotionData>,
    pub point_cloud: Option<PointCloud>,
}

/// Device driver collaborator.
///
/// All methods may block on the device; callers must not invoke them on an
/// async worker thread directly.
pub trait FrameSource: Send + Sync {
    /// Streaming status and active stream set of a device
    fn get_stream_status(&self, device_id: &DeviceId) -> Result<StreamStatus, FrameSourceError>;

    /// Most recent frame of one stream
    fn get_latest_frame(
        &self,
        device_id: &DeviceId,
        stream_type: &StreamType,
    ) -> Result<Frame, FrameSourceError>;

    /// Most recent metadata of one stream; `Ok(None)` when the stream is
    /// active but nothing has been captured yet
    fn get_latest_metadata(
        &self,
        device_id: &DeviceId,
        stream_type: &StreamType,
    ) -> Result<Option<StreamMetadata>, FrameSourceError>;
}
