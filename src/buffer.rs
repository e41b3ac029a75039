//! Client-side buffers
//!
//! A [`ClientBuffer`] is the platform's view of one server buffer. Importing
//! records into buffers is the job of a [`ClientBufferFactory`]; the
//! shared-memory implementation here maps the first descriptor of a record
//! for CPU rendering.

use crate::error::{Result, StreamError};
use memmap2::{MmapMut, MmapOptions};
use sluice_ipc::{BufferFlags, BufferRecord, PixelFormat, Size};
use std::fmt;
use std::fs::File;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// A buffer the client can render into
pub trait ClientBuffer: Send + Sync + fmt::Debug {
    fn size(&self) -> Size;
    fn stride(&self) -> u32;
    fn pixel_format(&self) -> PixelFormat;
    fn flags(&self) -> BufferFlags;

    /// Refresh from a newer record for the same buffer id
    fn update_from(&self, record: BufferRecord) -> Result<()>;

    /// Map the buffer contents for CPU writes
    fn secure_for_cpu_write(&self) -> Result<Arc<MemoryRegion>>;
}

/// Turns wire records into platform buffers
pub trait ClientBufferFactory: Send + Sync {
    fn create_buffer(
        &self,
        record: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<Arc<dyn ClientBuffer>>;
}

/// A buffer handed out by a vault, tagged with its server id
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub id: u32,
    pub buffer: Arc<dyn ClientBuffer>,
}

// ============================================================================
// CPU mappings
// ============================================================================

enum Mapping {
    Shared(MmapMut),
    Local(Vec<u8>),
}

impl Mapping {
    fn bytes(&mut self) -> &mut [u8] {
        match self {
            Self::Shared(map) => &mut map[..],
            Self::Local(bytes) => &mut bytes[..],
        }
    }
}

/// A CPU-writable view of a buffer
pub struct MemoryRegion {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    mapping: Mutex<Mapping>,
}

impl MemoryRegion {
    /// A region backed by process-local memory (no server-visible storage)
    pub fn local(size: Size, stride: u32, format: PixelFormat) -> Self {
        let len = stride as usize * size.height as usize;
        Self::with_mapping(size, stride, format, Mapping::Local(vec![0; len]))
    }

    fn with_mapping(size: Size, stride: u32, format: PixelFormat, mapping: Mapping) -> Self {
        Self {
            width: size.width,
            height: size.height,
            stride,
            format,
            mapping: Mutex::new(mapping),
        }
    }

    /// Run `f` over the mapped bytes
    pub fn with_pixels<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut mapping = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        f(mapping.bytes())
    }

    pub fn len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

// ============================================================================
// Shared-memory buffers
// ============================================================================

#[derive(Debug)]
struct ShmState {
    file: File,
    size: Size,
    stride: u32,
    format: PixelFormat,
    flags: BufferFlags,
}

/// A buffer backed by a shared-memory descriptor
#[derive(Debug)]
pub struct ShmBuffer {
    state: Mutex<ShmState>,
}

fn stride_for(record: &BufferRecord, size: Size, format: PixelFormat) -> u32 {
    if record.stride != 0 {
        record.stride
    } else {
        size.width * format.bytes_per_pixel()
    }
}

fn backing_file(mut record: BufferRecord) -> Result<File> {
    record
        .take_fds()
        .into_iter()
        .next()
        .map(File::from)
        .ok_or_else(|| {
            StreamError::Platform(format!(
                "buffer {} carries no shared-memory descriptor",
                record.buffer_id
            ))
        })
}

impl ShmBuffer {
    pub fn from_record(record: BufferRecord, size: Size, format: PixelFormat) -> Result<Self> {
        let stride = stride_for(&record, size, format);
        let flags = record.flags();
        let file = backing_file(record)?;
        Ok(Self {
            state: Mutex::new(ShmState {
                file,
                size,
                stride,
                format,
                flags,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientBuffer for ShmBuffer {
    fn size(&self) -> Size {
        self.lock().size
    }

    fn stride(&self) -> u32 {
        self.lock().stride
    }

    fn pixel_format(&self) -> PixelFormat {
        self.lock().format
    }

    fn flags(&self) -> BufferFlags {
        self.lock().flags
    }

    fn update_from(&self, record: BufferRecord) -> Result<()> {
        let mut state = self.lock();
        let size = record.size().unwrap_or(state.size);
        let format = match record.pixel_format {
            PixelFormat::Invalid => state.format,
            format => format,
        };
        state.stride = stride_for(&record, size, format);
        state.size = size;
        state.format = format;
        state.flags = record.flags();
        // a refreshed record may or may not resend the descriptor
        if record.fd_count() > 0 {
            state.file = backing_file(record)?;
        }
        Ok(())
    }

    fn secure_for_cpu_write(&self) -> Result<Arc<MemoryRegion>> {
        let state = self.lock();
        let len = state.stride as usize * state.size.height as usize;
        // SAFETY: the server only reads the pages while it holds the buffer,
        // and it does not hold it while the client has it mapped for writing.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&state.file) }
            .map_err(|e| StreamError::Platform(format!("failed to map buffer: {e}")))?;
        debug!("Mapped {} bytes ({:?}, stride {})", len, state.size, state.stride);
        Ok(Arc::new(MemoryRegion::with_mapping(
            state.size,
            state.stride,
            state.format,
            Mapping::Shared(map),
        )))
    }
}

/// Imports records as [`ShmBuffer`]s
#[derive(Debug, Default)]
pub struct ShmBufferFactory;

impl ClientBufferFactory for ShmBufferFactory {
    fn create_buffer(
        &self,
        record: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<Arc<dyn ClientBuffer>> {
        Ok(Arc::new(ShmBuffer::from_record(record, size, format)?))
    }
}
