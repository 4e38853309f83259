use std::ops::Range;
use std::path::Path;

use tracing::debug;

use crate::codec::FragmentCodec;
use crate::fragment::{CompressionOption, FragmentBackend, FragmentSet, compress_fragmented};
use crate::memory::FragmentPool;
use crate::{CozipDmaError, read_u32, write_u32};

const CHUNK_COUNT_LEN: usize = 4;
const CHUNK_ENTRY_LEN: usize = 8;
const PAYLOAD_ALIGNMENT: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub compressed_size: u32,
    pub original_size: u32,
}

/// `u32 chunk_count`, then `chunk_count` entries of
/// `{u32 compressed_size, u32 original_size}`, little endian. Payloads follow,
/// each padded to 4 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressedFileHeader {
    pub chunks: Vec<ChunkEntry>,
}

/// Byte ranges of one chunk in stream and output coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkLayout {
    pub compressed: Range<usize>,
    pub decompressed: Range<usize>,
}

impl CompressedFileHeader {
    pub fn encoded_len_for(chunk_count: usize) -> usize {
        CHUNK_COUNT_LEN + chunk_count * CHUNK_ENTRY_LEN
    }

    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.chunks.len())
    }

    /// Length of the header described by the leading chunk count, if at least
    /// four bytes are present.
    pub fn peek_encoded_len(bytes: &[u8]) -> Result<usize, CozipDmaError> {
        let count = read_u32(bytes, 0)? as usize;
        count
            .checked_mul(CHUNK_ENTRY_LEN)
            .and_then(|entries| entries.checked_add(CHUNK_COUNT_LEN))
            .ok_or(CozipDmaError::InvalidFrame("chunk count overflow"))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CozipDmaError> {
        let header_len = Self::peek_encoded_len(bytes)?;
        if bytes.len() < header_len {
            return Err(CozipDmaError::InvalidFrame("incomplete chunk header"));
        }

        let count = (header_len - CHUNK_COUNT_LEN) / CHUNK_ENTRY_LEN;
        let mut chunks = Vec::with_capacity(count);
        let mut cursor = CHUNK_COUNT_LEN;
        for _ in 0..count {
            let compressed_size = read_u32(bytes, cursor)?;
            let original_size = read_u32(bytes, cursor + 4)?;
            if compressed_size == 0 {
                return Err(CozipDmaError::InvalidFrame("empty chunk payload"));
            }
            chunks.push(ChunkEntry {
                compressed_size,
                original_size,
            });
            cursor += CHUNK_ENTRY_LEN;
        }
        Ok(Self { chunks })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), CozipDmaError> {
        write_u32(
            out,
            u32::try_from(self.chunks.len()).map_err(|_| CozipDmaError::DataTooLarge)?,
        );
        for chunk in &self.chunks {
            write_u32(out, chunk.compressed_size);
            write_u32(out, chunk.original_size);
        }
        Ok(())
    }

    /// Header plus padded payloads.
    pub fn stream_len(&self) -> u64 {
        self.encoded_len() as u64
            + self
                .chunks
                .iter()
                .map(|chunk| padded(chunk.compressed_size))
                .sum::<u64>()
    }

    pub fn decompressed_len(&self) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| u64::from(chunk.original_size))
            .sum()
    }

    pub fn check_stream_len(&self, expected: u64) -> Result<(), CozipDmaError> {
        if self.stream_len() != expected {
            return Err(CozipDmaError::DataChecksum(
                "chunk header does not describe the requested byte count",
            ));
        }
        Ok(())
    }

    pub(crate) fn layout(&self) -> Result<Vec<ChunkLayout>, CozipDmaError> {
        let mut layout = Vec::with_capacity(self.chunks.len());
        let mut compressed_at = self.encoded_len();
        let mut decompressed_at = 0usize;
        for chunk in &self.chunks {
            let compressed_end = compressed_at + chunk.compressed_size as usize;
            let decompressed_end = decompressed_at
                .checked_add(chunk.original_size as usize)
                .ok_or(CozipDmaError::DataTooLarge)?;
            layout.push(ChunkLayout {
                compressed: compressed_at..compressed_end,
                decompressed: decompressed_at..decompressed_end,
            });
            compressed_at += usize::try_from(padded(chunk.compressed_size))
                .map_err(|_| CozipDmaError::DataTooLarge)?;
            decompressed_at = decompressed_end;
        }
        Ok(layout)
    }
}

fn padded(size: u32) -> u64 {
    (u64::from(size) + PAYLOAD_ALIGNMENT - 1) & !(PAYLOAD_ALIGNMENT - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub option: CompressionOption,
    pub chunk_count: usize,
    pub original_len: u64,
    pub stream_len: u64,
    /// CRC-32 of the uncompressed input, for checking a later decode.
    pub original_crc32: u32,
}

/// Serializes filled fragments as one chunked stream.
pub fn encode_compressed_stream(
    pool: &FragmentPool,
    fragments: &FragmentSet,
) -> Result<Vec<u8>, CozipDmaError> {
    let header = CompressedFileHeader {
        chunks: fragments
            .fragments
            .iter()
            .map(|info| ChunkEntry {
                compressed_size: info.compressed_size,
                original_size: info.original_size,
            })
            .collect(),
    };

    let stream_len =
        usize::try_from(header.stream_len()).map_err(|_| CozipDmaError::DataTooLarge)?;
    let mut out = Vec::with_capacity(stream_len);
    header.write_to(&mut out)?;
    for (index, info) in fragments.fragments.iter().enumerate() {
        let payload = pool.payload(index)?;
        if payload.len() != info.compressed_size as usize {
            return Err(CozipDmaError::InvalidFrame(
                "fragment prefix disagrees with recorded size",
            ));
        }
        out.extend_from_slice(&payload);
        let pad = padded(info.compressed_size) as usize - payload.len();
        out.resize(out.len() + pad, 0);
    }
    Ok(out)
}

pub fn compress_to_stream(
    backend: &mut dyn FragmentBackend,
    pool: &mut FragmentPool,
    src: &[u8],
) -> Result<(Vec<u8>, StreamStats), CozipDmaError> {
    let fragments = compress_fragmented(backend, pool, src)?;
    let stream = encode_compressed_stream(pool, &fragments)?;
    let stats = StreamStats {
        option: backend.option(),
        chunk_count: fragments.len(),
        original_len: src.len() as u64,
        stream_len: stream.len() as u64,
        original_crc32: crc32fast::hash(src),
    };
    Ok((stream, stats))
}

/// Compresses the file at `src_path` into a chunked stream at `dst_path`.
pub fn compress_file(
    backend: &mut dyn FragmentBackend,
    pool: &mut FragmentPool,
    src_path: &Path,
    dst_path: &Path,
) -> Result<StreamStats, CozipDmaError> {
    let input = std::fs::read(src_path)?;
    let (stream, stats) = compress_to_stream(backend, pool, &input)?;
    std::fs::write(dst_path, &stream)?;
    debug!(
        src = %src_path.display(),
        dst = %dst_path.display(),
        original = stats.original_len,
        written = stats.stream_len,
        crc32 = stats.original_crc32,
        "compressed file written"
    );
    Ok(stats)
}

/// Synchronous reference decoder for a whole chunked stream.
pub fn decode_compressed_stream(
    stream: &[u8],
    codec: &dyn FragmentCodec,
) -> Result<Vec<u8>, CozipDmaError> {
    let header = CompressedFileHeader::parse(stream)?;
    header.check_stream_len(stream.len() as u64)?;

    let total =
        usize::try_from(header.decompressed_len()).map_err(|_| CozipDmaError::DataTooLarge)?;
    let mut out = vec![0u8; total];
    for (index, chunk) in header.layout()?.into_iter().enumerate() {
        let src = &stream[chunk.compressed];
        let expected = chunk.decompressed.len();
        let written = codec.decompress(src, &mut out[chunk.decompressed])?;
        if written != expected {
            return Err(CozipDmaError::Codec {
                index,
                code: crate::DMA_STATUS_SIZE_MISMATCH,
            });
        }
    }
    Ok(out)
}
