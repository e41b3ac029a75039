//! Sluice IPC Protocol
//!
//! Wire records shared between a buffer-stream client and the display server,
//! plus the framing used to move them over a Unix stream socket. Buffer file
//! descriptors never travel inside a frame; they follow it out-of-band via
//! [`fd_channel`].

pub mod fd_channel;

pub use fd_channel::{recv_fds, send_fds, ChannelError};

use bitflags::bitflags;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

/// Largest frame we are willing to read
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

// ============================================================================
// Geometry & Formats
// ============================================================================

/// Width and height of a buffer in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both dimensions, rounding to the nearest pixel
    pub fn scaled(self, scale: f32) -> Self {
        Self {
            width: (self.width as f32 * scale).round() as u32,
            height: (self.height as f32 * scale).round() as u32,
        }
    }
}

/// Pixel layout of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Invalid,
    Abgr8888,
    Xbgr8888,
    Argb8888,
    Xrgb8888,
    Bgr888,
    Rgb888,
    Rgb565,
    Rgba5551,
    Rgba4444,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::Abgr8888 | Self::Xbgr8888 | Self::Argb8888 | Self::Xrgb8888 => 4,
            Self::Bgr888 | Self::Rgb888 => 3,
            Self::Rgb565 | Self::Rgba5551 | Self::Rgba4444 => 2,
        }
    }
}

/// Who is expected to touch the buffer contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferUsage {
    /// GPU rendering, contents are opaque to the CPU
    Hardware,
    /// CPU rendering through a memory mapping
    #[default]
    Software,
}

bitflags! {
    /// Platform hints attached to a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// The buffer can be scanned out directly by the display
        const CAN_SCANOUT = 1 << 0;
        /// The buffer contents are y-inverted
        const Y_INVERTED = 1 << 1;
    }
}

/// Server-assigned identifier of a buffer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferStreamId(pub i32);

/// Server-assigned identifier of a screencast session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreencastId(pub i32);

// ============================================================================
// Buffer Record
// ============================================================================

/// One buffer as described on the wire.
///
/// The descriptors are owned by the record; whoever holds the record holds the
/// buffer. They are skipped by serde and carried by [`send_fds`] instead, with
/// only their count inside the frame.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BufferRecord {
    pub buffer_id: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub usage: BufferUsage,
    pub flags: u32,
    /// Platform-specific inline words (e.g. modifiers, offsets)
    pub data: Vec<i32>,
    pub error: Option<String>,
    fd_count: u32,
    #[serde(skip)]
    fds: Vec<OwnedFd>,
}

impl BufferRecord {
    pub fn new(buffer_id: u32, size: Size, stride: u32, pixel_format: PixelFormat) -> Self {
        Self {
            buffer_id,
            width: size.width,
            height: size.height,
            stride,
            pixel_format,
            ..Default::default()
        }
    }

    /// A record that only reports a failure
    pub fn with_error(buffer_id: u32, error: impl Into<String>) -> Self {
        Self {
            buffer_id,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Attach the descriptors backing this buffer
    pub fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fd_count = fds.len() as u32;
        self.fds = fds;
        self
    }

    /// Reported size, if the record carries one
    pub fn size(&self) -> Option<Size> {
        (self.width != 0 && self.height != 0).then(|| Size::new(self.width, self.height))
    }

    /// Set the platform hints carried in the frame
    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    /// Known platform hints; unknown bits are dropped
    pub fn flags(&self) -> BufferFlags {
        BufferFlags::from_bits_truncate(self.flags)
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Number of descriptors announced in the frame
    pub fn fd_count(&self) -> usize {
        self.fd_count as usize
    }

    /// Take ownership of the descriptors, leaving the record without any
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        self.fd_count = 0;
        std::mem::take(&mut self.fds)
    }
}

// ============================================================================
// Requests & Replies
// ============================================================================

/// Reply to a buffer stream creation request.
///
/// A reply carrying a first buffer means the server speaks the exchange
/// protocol; without one the client allocates its own buffers.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BufferStreamReply {
    pub id: Option<BufferStreamId>,
    pub pixel_format: PixelFormat,
    pub usage: BufferUsage,
    pub buffer: Option<BufferRecord>,
    pub error: Option<String>,
}

/// Hand a buffer to the server for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequest {
    pub id: BufferStreamId,
    pub buffer_id: u32,
}

/// Parameters of one buffer to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferParameters {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAllocation {
    pub id: BufferStreamId,
    pub buffer_requests: Vec<BufferParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRelease {
    pub id: BufferStreamId,
    pub buffer_ids: Vec<u32>,
}

/// Stream attribute change; unset fields are left alone by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub id: BufferStreamId,
    pub swap_interval: Option<i32>,
    pub scale: Option<f32>,
}

impl StreamConfiguration {
    pub fn swap_interval(id: BufferStreamId, interval: i32) -> Self {
        Self {
            id,
            swap_interval: Some(interval),
            scale: None,
        }
    }

    pub fn scale(id: BufferStreamId, scale: f32) -> Self {
        Self {
            id,
            swap_interval: None,
            scale: Some(scale),
        }
    }
}

// ============================================================================
// Message Framing
// ============================================================================

/// A framed message with length prefix for reliable socket reads
#[derive(Debug)]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message from serializable data
    pub fn new<T: Serialize>(msg: &T) -> Result<Self, ChannelError> {
        let data = serde_json::to_vec(msg)?;
        Ok(Self { data })
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ChannelError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Write a record frame followed by its descriptors
pub fn write_record(socket: &UnixStream, record: &BufferRecord) -> Result<(), ChannelError> {
    let frame = FramedMessage::new(record)?.encode();
    let mut writer = socket;
    writer.write_all(&frame)?;
    send_fds(socket, record.fds())
}

/// Read one record frame and reattach the descriptors that follow it
pub fn read_record(socket: &UnixStream) -> Result<BufferRecord, ChannelError> {
    let mut reader = socket;
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ChannelError::Closed,
        _ => e.into(),
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let mut record: BufferRecord = FramedMessage::decode(&body)?;

    let expected = record.fd_count();
    if expected > 0 {
        let fds = recv_fds(socket, expected)?;
        if fds.len() != expected {
            return Err(ChannelError::FdCountMismatch {
                expected,
                received: fds.len(),
            });
        }
        record.fds = fds;
    }
    Ok(record)
}
