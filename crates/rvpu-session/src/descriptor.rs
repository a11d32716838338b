//! Buffer handle exchange.
//!
//! A [`BufferDescriptor`] names a frame or bitstream buffer. Process-local
//! fields (file descriptor, pointer) never cross the channel: the transmitted
//! copy always carries zero in both, and decoding forces them to zero again.
//! The receiving side re-acquires the buffer through a [`BufferImporter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::engine::TaskStatus;
use crate::error::DescriptorError;

/// Value a consumer stores in the ready-flag word before it waits.
pub const READY_SENTINEL: u32 = u32::MAX;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferKind {
    /// Process-private heap memory; only its size is meaningful remotely.
    Heap = 0,
    /// Shared memory reachable from both sides through an opaque handle.
    Shared = 1,
}

impl BufferKind {
    fn from_wire(value: u32) -> Result<Self, DescriptorError> {
        match value {
            0 => Ok(BufferKind::Heap),
            1 => Ok(BufferKind::Shared),
            other => Err(DescriptorError::UnknownKind(other)),
        }
    }
}

/// Description of one buffer, built fresh per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub kind: BufferKind,
    /// Byte count (capacity for outputs, payload size for inputs and replies).
    pub size: u64,
    /// Local file descriptor; meaningless in another process.
    pub fd: i32,
    /// Opaque platform handle, the only identity that travels.
    pub handle: u64,
    /// Local mapping address; meaningless in another process.
    pub ptr: u64,
}

impl BufferDescriptor {
    /// Encoded length: `kind:u32 | size:u64 | fd:i32 | handle:u64 | ptr:u64`.
    pub const WIRE_SIZE: usize = 32;

    pub fn heap(size: u64) -> Self {
        Self {
            kind: BufferKind::Heap,
            size,
            fd: 0,
            handle: 0,
            ptr: 0,
        }
    }

    pub fn shared(handle: u64, size: u64) -> Self {
        Self {
            kind: BufferKind::Shared,
            size,
            fd: 0,
            handle,
            ptr: 0,
        }
    }

    /// Attach process-local identity.
    pub fn with_local(mut self, fd: i32, ptr: u64) -> Self {
        self.fd = fd;
        self.ptr = ptr;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn is_shared(&self) -> bool {
        self.kind == BufferKind::Shared
    }

    /// Copy safe to transmit: local fd and pointer zeroed.
    pub fn sanitized(&self) -> Self {
        Self {
            fd: 0,
            ptr: 0,
            ..*self
        }
    }

    /// Little-endian wire form of the sanitized copy.
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let clean = self.sanitized();
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&(clean.kind as u32).to_le_bytes());
        out[4..12].copy_from_slice(&clean.size.to_le_bytes());
        out[12..16].copy_from_slice(&clean.fd.to_le_bytes());
        out[16..24].copy_from_slice(&clean.handle.to_le_bytes());
        out[24..32].copy_from_slice(&clean.ptr.to_le_bytes());
        out
    }

    /// Parse a received descriptor. Local fields are zeroed whatever the
    /// peer sent.
    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let bytes: &[u8; Self::WIRE_SIZE] =
            bytes
                .try_into()
                .map_err(|_| DescriptorError::SizeMismatch {
                    expected: Self::WIRE_SIZE,
                    got: bytes.len(),
                })?;

        let kind = BufferKind::from_wire(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))?;
        let size = u64::from_le_bytes(le8(&bytes[4..12]));
        let handle = u64::from_le_bytes(le8(&bytes[16..24]));

        Ok(Self {
            kind,
            size,
            fd: 0,
            handle,
            ptr: 0,
        })
    }
}

fn le8(src: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(src);
    out
}

/// WAIT request payload: the output descriptor, then an optional `u64` tag
/// the engine host echoes in its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRequest {
    pub output: BufferDescriptor,
    pub tag: Option<u64>,
}

impl WaitRequest {
    pub const TAGGED_SIZE: usize = BufferDescriptor::WIRE_SIZE + 8;

    pub fn new(output: BufferDescriptor) -> Self {
        Self { output, tag: None }
    }

    pub fn tagged(output: BufferDescriptor, tag: u64) -> Self {
        Self {
            output,
            tag: Some(tag),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.output.encode().to_vec();
        if let Some(tag) = self.tag {
            out.extend_from_slice(&tag.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let (desc, tag) = match bytes.len() {
            BufferDescriptor::WIRE_SIZE => (bytes, None),
            Self::TAGGED_SIZE => {
                let (desc, tag) = bytes.split_at(BufferDescriptor::WIRE_SIZE);
                (desc, Some(u64::from_le_bytes(le8(tag))))
            }
            got => {
                return Err(DescriptorError::SizeMismatch {
                    expected: Self::TAGGED_SIZE,
                    got,
                })
            }
        };
        Ok(Self {
            output: BufferDescriptor::decode(desc)?,
            tag,
        })
    }
}

/// Round-trip answer to a WAIT: output descriptor sized to the produced
/// bytes, then `status:u32 | tag:u64`.
///
/// A bare 32-byte descriptor is read as an untagged success. Tag 0 in the
/// trailer means untagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReply {
    pub output: BufferDescriptor,
    pub status: TaskStatus,
    pub tag: Option<u64>,
}

impl WaitReply {
    pub const WIRE_SIZE: usize = BufferDescriptor::WIRE_SIZE + 4 + 8;

    pub fn done(output: BufferDescriptor, tag: Option<u64>) -> Self {
        Self {
            output,
            status: TaskStatus::Done,
            tag,
        }
    }

    pub fn failed(tag: Option<u64>) -> Self {
        Self {
            output: BufferDescriptor::heap(0),
            status: TaskStatus::Failed,
            tag,
        }
    }

    /// Without a tag only the descriptor is sent.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.output.encode().to_vec();
        if self.tag.is_none() && self.status == TaskStatus::Done {
            return out;
        }
        let status: u32 = match self.status {
            TaskStatus::Done => 0,
            TaskStatus::Failed => 1,
        };
        out.extend_from_slice(&status.to_le_bytes());
        out.extend_from_slice(&self.tag.unwrap_or(0).to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() == BufferDescriptor::WIRE_SIZE {
            return Ok(Self::done(BufferDescriptor::decode(bytes)?, None));
        }
        if bytes.len() != Self::WIRE_SIZE {
            return Err(DescriptorError::SizeMismatch {
                expected: Self::WIRE_SIZE,
                got: bytes.len(),
            });
        }

        let (desc, trailer) = bytes.split_at(BufferDescriptor::WIRE_SIZE);
        let status = match u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) {
            0 => TaskStatus::Done,
            _ => TaskStatus::Failed,
        };
        Ok(Self {
            output: BufferDescriptor::decode(desc)?,
            status,
            tag: Some(u64::from_le_bytes(le8(&trailer[4..12]))).filter(|tag| *tag != 0),
        })
    }
}

/// The completion word a consumer arms and a producer publishes into.
pub trait ReadyFlag: Send + Sync {
    /// Store [`READY_SENTINEL`].
    fn arm(&self);
    /// Current value.
    fn load(&self) -> u32;
    /// Store the completed byte count.
    fn publish(&self, value: u32);
}

impl ReadyFlag for AtomicU32 {
    fn arm(&self) {
        self.store(READY_SENTINEL, Ordering::Release);
    }

    fn load(&self) -> u32 {
        AtomicU32::load(self, Ordering::Acquire)
    }

    fn publish(&self, value: u32) {
        self.store(value, Ordering::Release);
    }
}

/// A shared output or input region with its ready-flag word at the head.
#[derive(Debug)]
pub struct SharedRegion {
    handle: u64,
    capacity: usize,
    ready: AtomicU32,
    data: Mutex<Vec<u8>>,
}

impl SharedRegion {
    pub fn new(handle: u64, capacity: usize) -> Self {
        Self {
            handle,
            capacity,
            ready: AtomicU32::new(0),
            data: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Descriptor naming this region with its full capacity.
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor::shared(self.handle, self.capacity as u64)
    }

    /// Replace the region contents.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, DescriptorError> {
        if bytes.len() > self.capacity {
            return Err(DescriptorError::RegionTooSmall {
                size: bytes.len() as u64,
                capacity: self.capacity,
            });
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.clear();
        data.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Copy of the current contents.
    pub fn read(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ready(&self) -> &AtomicU32 {
        &self.ready
    }
}

impl ReadyFlag for SharedRegion {
    fn arm(&self) {
        self.ready.arm();
    }

    fn load(&self) -> u32 {
        ReadyFlag::load(&self.ready)
    }

    fn publish(&self, value: u32) {
        self.ready.publish(value);
    }
}

/// A buffer re-acquired on the receiving side of the channel.
#[derive(Debug, Clone)]
pub struct ImportedBuffer {
    pub descriptor: BufferDescriptor,
    region: Option<Arc<SharedRegion>>,
}

impl ImportedBuffer {
    /// A heap buffer known only by size.
    pub fn detached(descriptor: BufferDescriptor) -> Self {
        Self {
            descriptor,
            region: None,
        }
    }

    pub fn attached(descriptor: BufferDescriptor, region: Arc<SharedRegion>) -> Self {
        Self {
            descriptor,
            region: Some(region),
        }
    }

    pub fn size(&self) -> usize {
        self.descriptor.size as usize
    }

    pub fn region(&self) -> Option<&Arc<SharedRegion>> {
        self.region.as_ref()
    }
}

/// Host hook mapping a received descriptor back to a usable buffer.
pub trait BufferImporter: Send + Sync {
    fn import_descriptor(&self, descriptor: &BufferDescriptor) -> Result<ImportedBuffer, DescriptorError>;
}

/// In-process importer keyed by the opaque handle.
#[derive(Debug)]
pub struct HandleTable {
    regions: Mutex<HashMap<u64, Arc<SharedRegion>>>,
    next_handle: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Create and register a region with a fresh handle.
    pub fn allocate(&self, capacity: usize) -> Arc<SharedRegion> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(SharedRegion::new(handle, capacity));
        self.insert(Arc::clone(&region));
        region
    }

    pub fn insert(&self, region: Arc<SharedRegion>) {
        debug!(handle = region.handle(), capacity = region.capacity(), "shared region registered");
        self.lock().insert(region.handle(), region);
    }

    pub fn get(&self, handle: u64) -> Option<Arc<SharedRegion>> {
        self.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: u64) -> Option<Arc<SharedRegion>> {
        self.lock().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<SharedRegion>>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferImporter for HandleTable {
    fn import_descriptor(&self, descriptor: &BufferDescriptor) -> Result<ImportedBuffer, DescriptorError> {
        let descriptor = descriptor.sanitized();
        match descriptor.kind {
            BufferKind::Heap => Ok(ImportedBuffer::detached(descriptor)),
            BufferKind::Shared => {
                let region = self
                    .get(descriptor.handle)
                    .ok_or(DescriptorError::UnknownHandle(descriptor.handle))?;
                if descriptor.size > region.capacity() as u64 {
                    return Err(DescriptorError::RegionTooSmall {
                        size: descriptor.size,
                        capacity: region.capacity(),
                    });
                }
                Ok(ImportedBuffer::attached(descriptor, region))
            }
        }
    }
}
