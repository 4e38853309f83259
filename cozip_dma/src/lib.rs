use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

mod codec;
mod dma;
mod fragment;
mod frame;
mod memory;
mod source;
mod stream_state;
mod stream_worker;
mod streaming;
mod workbench;

pub use codec::{FragmentCodec, ZlibCodec, ZopfliCodec};
pub use dma::{
    DMA_STATUS_CORRUPT_STREAM, DMA_STATUS_OK, DMA_STATUS_OUT_OF_RANGE,
    DMA_STATUS_OUTPUT_OVERFLOW, DMA_STATUS_SIZE_MISMATCH, DmaCommandList, DmaDevice, DmaQueue,
    ErrorCodePage, Fence, FrameSync, QueueDesc, SourceBytes,
};
pub use fragment::{
    CompressionOption, DmaBackend, FragmentBackend, FragmentInfo, FragmentSet, SoftwareBackend,
    chunked_compress_with_zlib, chunked_compress_with_zopfli, compress_fragmented,
    decompress_fragmented, shrink_slice_len,
};
pub use frame::{
    ChunkEntry, CompressedFileHeader, StreamStats, compress_file, compress_to_stream,
    decode_compressed_stream, encode_compressed_stream,
};
pub use memory::{AlignedBuffer, DmaBuffer, FragmentPool, PAGE_SIZE, align_down, align_up};
pub use source::CompressedSource;
pub use stream_state::ChunkDispatch;
pub use streaming::{
    CompletionRoutine, ContextStats, DecompressedOutput, DmaKickoffBehavior, OutputAllocator,
    PendingRead, ReadOptions, ReadStats, StreamingDma, StreamingOptions, init_streaming_dma,
    read_file_compressed, shutdown_streaming_dma, streaming_dma_explicit_tick,
};
pub use workbench::{CompressionWorkbench, WorkbenchReport, WorkbenchSettings};

/// Capacity of one fragment buffer, size prefix included.
pub const FRAGMENT_CAPACITY: usize = 4 * 1024 * 1024;
/// Granularity of the streaming reader's disk reads.
pub const READ_BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// Offset and length alignment demanded by unbuffered file handles.
pub const UNBUFFERED_READ_ALIGNMENT: usize = 4 * 1024;
/// Decompressed output buffers are rounded up to this size.
pub const DMA_MEMORY_ALLOCATION_SIZE: usize = 64 * 1024;
pub const MAX_CONCURRENT_REQUESTS: usize = 8;
pub const MAX_QUEUE_DEPTH_PER_FILE: usize = 4;
/// Upper bound on slice shrink retries for a single fragment.
pub const MAX_SHRINK_ATTEMPTS: u32 = 32;

const FRAGMENT_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CozipDmaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("streaming context is not initialized")]
    NotInitialized,
    #[error("streaming context is already initialized")]
    AlreadyInitialized,
    #[error("streaming context is shutting down")]
    ShutDown,
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error 0x{code:08x} at unit {index}")]
    Codec { index: usize, code: u32 },
    #[error("data checksum error: {0}")]
    DataChecksum(&'static str),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("fragment {index} cannot fit {capacity} bytes after shrinking to {slice_len}")]
    FragmentOverflow {
        index: usize,
        slice_len: usize,
        capacity: usize,
    },
    #[error("transfer engine failed: {0}")]
    Engine(String),
    #[error("data too large")]
    DataTooLarge,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, CozipDmaError> {
    mutex
        .lock()
        .map_err(|_| CozipDmaError::Internal("mutex poisoned"))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, CozipDmaError> {
    let end = offset
        .checked_add(4)
        .ok_or(CozipDmaError::InvalidFrame("offset overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(CozipDmaError::InvalidFrame("unexpected end of data"))?;
    let array: [u8; 4] = slice
        .try_into()
        .map_err(|_| CozipDmaError::InvalidFrame("failed to read u32"))?;
    Ok(u32::from_le_bytes(array))
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests;
