use std::io;
use std::ops::{Range, RangeInclusive};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::dma::{DMA_STATUS_OK, ErrorCodePage, Fence, SourceBytes};
use crate::frame::{ChunkLayout, CompressedFileHeader};
use crate::memory::{AlignedBuffer, DmaBuffer, align_up};
use crate::source::CompressedSource;
use crate::streaming::{
    CompletionRoutine, DecompressedOutput, OutputAllocator, ReadOptions, ReadSlot, ReadStats,
    StreamingOptions,
};
use crate::{CozipDmaError, DMA_MEMORY_ALLOCATION_SIZE};

pub(crate) type FileId = u64;

/// Growable bitset, one bit per read block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BlockBits {
    words: Vec<u64>,
}

impl BlockBits {
    pub fn with_len(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 64);
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .is_some_and(|word| word & (1 << (bit % 64)) != 0)
    }

    pub fn all_set(&self, bits: RangeInclusive<usize>) -> bool {
        bits.into_iter().all(|bit| self.get(bit))
    }

    pub fn ones(&self) -> Vec<usize> {
        (0..self.words.len() * 64).filter(|&bit| self.get(bit)).collect()
    }
}

/// One disk read: which file bytes land where in the block's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadPlan {
    pub block: usize,
    pub file_offset: u64,
    pub len: usize,
    /// Offset of the block's first stream byte inside the read buffer.
    pub data_start: usize,
    pub data_len: usize,
    pub aligned: bool,
}

/// Record of one chunk handed to the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDispatch {
    pub chunk: usize,
    pub first_block: usize,
    pub last_block: usize,
    /// Blocks whose reads had completed when the chunk was dispatched.
    pub completed_blocks: Vec<usize>,
}

pub(crate) struct ChunkWork {
    pub chunk: usize,
    pub dst_range: Range<usize>,
    pub src: SourceBytes,
    pub tail_fill: Option<Range<usize>>,
}

pub(crate) struct DispatchBatch {
    pub work: Vec<ChunkWork>,
    pub signal_fence: bool,
}

/// Delivers the outcome of one read exactly once.
pub(crate) struct CompletionSink {
    slot: Arc<ReadSlot>,
    completion: Option<CompletionRoutine>,
}

impl CompletionSink {
    pub fn deliver(mut self, outcome: Result<DecompressedOutput, CozipDmaError>) {
        if let Some(routine) = self.completion.take() {
            routine(&outcome);
        }
        self.slot.complete(outcome);
    }
}

/// Worker-side state of one in-flight compressed read.
pub(crate) struct FileReadState {
    pub id: FileId,
    source: Arc<dyn CompressedSource>,
    stream_offset: u64,
    total_len: usize,
    block_size: usize,
    alignment: usize,
    block_count: usize,
    issued: BlockBits,
    complete: BlockBits,
    spare_buffers: Vec<Option<AlignedBuffer>>,
    blocks: Vec<Option<(Arc<AlignedBuffer>, Range<usize>)>>,
    aligned_reads: bool,
    layout: Option<Vec<ChunkLayout>>,
    allocator: Option<OutputAllocator>,
    output: Option<DmaBuffer>,
    decompressed_len: usize,
    chunk_queued: Vec<bool>,
    tracking: Option<Arc<ErrorCodePage>>,
    all_queued: bool,
    fence: Option<Arc<Fence>>,
    requests_in_flight: usize,
    peak_in_flight: usize,
    bytes_read: u64,
    dispatches: Vec<ChunkDispatch>,
    error: Option<CozipDmaError>,
    sink: Option<CompletionSink>,
}

impl FileReadState {
    pub fn new(
        id: FileId,
        source: Arc<dyn CompressedSource>,
        stream_offset: u64,
        total_len: usize,
        options: &StreamingOptions,
        read_options: ReadOptions,
        slot: Arc<ReadSlot>,
    ) -> Result<Self, CozipDmaError> {
        let block_size = options.read_block_size;
        let alignment = options.unbuffered_alignment;
        let block_count = total_len.div_ceil(block_size);

        // Each block gets room for an aligned re-read with leading and
        // trailing slack.
        let mut spare_buffers = Vec::with_capacity(block_count);
        for block in 0..block_count {
            let data_len = block_size.min(total_len - block * block_size);
            let capacity = align_up(data_len, alignment) + 2 * alignment;
            spare_buffers.push(Some(AlignedBuffer::zeroed(capacity)?));
        }

        Ok(Self {
            id,
            source,
            stream_offset,
            total_len,
            block_size,
            alignment,
            block_count,
            issued: BlockBits::with_len(block_count),
            complete: BlockBits::with_len(block_count),
            spare_buffers,
            blocks: (0..block_count).map(|_| None).collect(),
            aligned_reads: false,
            layout: None,
            allocator: read_options.allocator,
            output: None,
            decompressed_len: 0,
            chunk_queued: Vec::new(),
            tracking: None,
            all_queued: false,
            fence: None,
            requests_in_flight: 0,
            peak_in_flight: 0,
            bytes_read: 0,
            dispatches: Vec::new(),
            error: None,
            sink: Some(CompletionSink {
                slot,
                completion: read_options.completion,
            }),
        })
    }

    pub fn source(&self) -> Arc<dyn CompressedSource> {
        Arc::clone(&self.source)
    }

    pub fn requests_in_flight(&self) -> usize {
        self.requests_in_flight
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn header_parsed(&self) -> bool {
        self.layout.is_some()
    }

    /// Drops the completion sink for a request that never reached the worker.
    pub fn disarm(&mut self) {
        self.sink = None;
    }

    /// First error wins; later failures of the same file are dropped.
    pub fn fail(&mut self, error: CozipDmaError) {
        if self.error.is_none() {
            warn!(file = self.id, %error, "compressed read failed");
            self.error = Some(error);
        }
    }

    pub fn next_unissued_block(&self) -> Option<usize> {
        if self.error.is_some() {
            return None;
        }
        (0..self.block_count).find(|&block| !self.issued.get(block))
    }

    fn block_data_len(&self, block: usize) -> usize {
        self.block_size.min(self.total_len - block * self.block_size)
    }

    pub fn plan_read(&self, block: usize) -> Result<ReadPlan, CozipDmaError> {
        const OUT_OF_RANGE: CozipDmaError =
            CozipDmaError::InvalidArgument("read range overflows the file offset");

        let data_len = self.block_data_len(block);
        let stream_pos = (block as u64)
            .checked_mul(self.block_size as u64)
            .and_then(|skip| self.stream_offset.checked_add(skip))
            .ok_or(OUT_OF_RANGE)?;

        if !self.aligned_reads {
            return Ok(ReadPlan {
                block,
                file_offset: stream_pos,
                len: align_up(data_len, self.alignment),
                data_start: 0,
                data_len,
                aligned: false,
            });
        }

        let alignment = self.alignment as u64;
        let start = stream_pos & !(alignment - 1);
        let end = stream_pos
            .checked_add(data_len as u64 + alignment - 1)
            .ok_or(OUT_OF_RANGE)?
            & !(alignment - 1);
        Ok(ReadPlan {
            block,
            file_offset: start,
            len: (end - start) as usize,
            data_start: (stream_pos - start) as usize,
            data_len,
            aligned: true,
        })
    }

    pub fn take_block_buffer(&mut self, block: usize) -> Result<AlignedBuffer, CozipDmaError> {
        self.spare_buffers
            .get_mut(block)
            .and_then(Option::take)
            .ok_or(CozipDmaError::Internal("read block buffer already in use"))
    }

    pub fn mark_issued(&mut self, block: usize) {
        self.issued.set(block);
        self.requests_in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.requests_in_flight);
    }

    pub fn finish_request(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }

    /// An unaligned read rejected by the handle is reissued in aligned mode.
    pub fn should_retry_aligned(&self, plan: &ReadPlan, error: &io::Error) -> bool {
        if plan.aligned || error.kind() != io::ErrorKind::InvalidInput {
            return false;
        }
        let alignment = self.alignment as u64;
        self.aligned_reads
            || plan.file_offset % alignment != 0
            || plan.len as u64 % alignment != 0
    }

    pub fn enable_aligned_reads(&mut self) {
        if !self.aligned_reads {
            warn!(
                file = self.id,
                lead = self.stream_offset % self.alignment as u64,
                "handle rejected unaligned read, switching to aligned reads"
            );
            self.aligned_reads = true;
        }
    }

    pub fn complete_read(
        &mut self,
        plan: &ReadPlan,
        buffer: AlignedBuffer,
        bytes_read: usize,
    ) -> Result<(), CozipDmaError> {
        self.bytes_read += bytes_read as u64;
        let data_end = plan.data_start + plan.data_len;
        if bytes_read < data_end {
            return Err(CozipDmaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from compressed source",
            )));
        }

        let slot = self
            .blocks
            .get_mut(plan.block)
            .ok_or(CozipDmaError::Internal("read block out of range"))?;
        *slot = Some((Arc::new(buffer), plan.data_start..data_end));
        self.complete.set(plan.block);
        trace!(file = self.id, block = plan.block, bytes_read, "read block complete");

        if plan.block == 0 {
            self.parse_header()?;
        }
        Ok(())
    }

    fn parse_header(&mut self) -> Result<(), CozipDmaError> {
        let header = {
            let (block, range) = self.blocks[0]
                .as_ref()
                .ok_or(CozipDmaError::Internal("first block missing"))?;
            let bytes = &block[range.clone()];
            let header_len = CompressedFileHeader::peek_encoded_len(bytes)
                .map_err(|_| CozipDmaError::DataChecksum("stream too short for a chunk header"))?;
            if header_len > bytes.len() {
                return Err(CozipDmaError::DataChecksum(
                    "chunk header does not fit in the first read block",
                ));
            }
            CompressedFileHeader::parse(bytes)?
        };
        header.check_stream_len(self.total_len as u64)?;

        let layout = header.layout()?;
        self.decompressed_len =
            usize::try_from(header.decompressed_len()).map_err(|_| CozipDmaError::DataTooLarge)?;
        let alloc_len = align_up(self.decompressed_len, DMA_MEMORY_ALLOCATION_SIZE);

        let buffer = match self.allocator.take() {
            Some(allocate) => {
                let buffer = allocate(alloc_len).ok_or(CozipDmaError::OutOfMemory(alloc_len))?;
                if buffer.len() < self.decompressed_len {
                    return Err(CozipDmaError::OutOfMemory(alloc_len));
                }
                buffer
            }
            None => AlignedBuffer::zeroed(alloc_len)?,
        };

        self.output = Some(DmaBuffer::from_aligned(buffer));
        self.tracking = Some(ErrorCodePage::new(layout.len() + 1));
        self.chunk_queued = vec![false; layout.len() + 1];
        debug!(
            file = self.id,
            chunks = layout.len(),
            decompressed = self.decompressed_len,
            "chunk header parsed"
        );
        self.layout = Some(layout);
        Ok(())
    }

    pub fn output(&self) -> Result<&DmaBuffer, CozipDmaError> {
        self.output
            .as_ref()
            .ok_or(CozipDmaError::Internal("output buffer not allocated"))
    }

    pub fn tracking(&self) -> Result<&Arc<ErrorCodePage>, CozipDmaError> {
        self.tracking
            .as_ref()
            .ok_or(CozipDmaError::Internal("tracking page not allocated"))
    }

    pub fn sentinel_slot(&self) -> usize {
        self.chunk_queued.len().saturating_sub(1)
    }

    /// Collects every chunk whose covering blocks have all completed and that
    /// has not been queued yet.
    pub fn collect_dispatch(&mut self) -> Result<Option<DispatchBatch>, CozipDmaError> {
        if self.error.is_some() || self.all_queued {
            return Ok(None);
        }
        let Some(layout) = self.layout.as_ref() else {
            return Ok(None);
        };
        let output_len = self.output()?.len();
        let chunk_count = layout.len();

        let mut work = Vec::new();
        for (chunk, entry) in layout.iter().enumerate() {
            if self.chunk_queued[chunk] {
                continue;
            }
            let blocks = self.covering_blocks(&entry.compressed);
            if !self.complete.all_set(blocks.clone()) {
                continue;
            }

            let tail_fill = if chunk + 1 == chunk_count {
                let original = entry.decompressed.len();
                Some(entry.decompressed.start + (original & !3)..output_len)
            } else {
                None
            };

            work.push(ChunkWork {
                chunk,
                dst_range: entry.decompressed.clone(),
                src: self.gather(&entry.compressed)?,
                tail_fill,
            });
            self.dispatches.push(ChunkDispatch {
                chunk,
                first_block: *blocks.start(),
                last_block: *blocks.end(),
                completed_blocks: self.complete.ones(),
            });
        }

        for item in &work {
            self.chunk_queued[item.chunk] = true;
            if item.tail_fill.is_some() {
                let sentinel = self.sentinel_slot();
                self.chunk_queued[sentinel] = true;
            }
        }

        let signal_fence = self.chunk_queued[..chunk_count].iter().all(|queued| *queued);
        self.all_queued = signal_fence;
        if work.is_empty() && !signal_fence {
            return Ok(None);
        }
        trace!(file = self.id, chunks = work.len(), signal_fence, "chunks ready for dispatch");
        Ok(Some(DispatchBatch { work, signal_fence }))
    }

    fn covering_blocks(&self, range: &Range<usize>) -> RangeInclusive<usize> {
        let first = range.start / self.block_size;
        let last = (range.end.max(range.start + 1) - 1) / self.block_size;
        first..=last
    }

    fn gather(&self, range: &Range<usize>) -> Result<SourceBytes, CozipDmaError> {
        let mut spans = Vec::new();
        for block in self.covering_blocks(range) {
            let (buffer, data) = self
                .blocks
                .get(block)
                .and_then(Option::as_ref)
                .ok_or(CozipDmaError::Internal("covering block not resident"))?;
            let block_start = block * self.block_size;
            let from = range.start.max(block_start) - block_start;
            let to = range.end.min(block_start + data.len()) - block_start;
            spans.push((Arc::clone(buffer), data.start + from..data.start + to));
        }
        Ok(SourceBytes::Spans(spans))
    }

    pub fn set_fence(&mut self, fence: Arc<Fence>) {
        self.fence = Some(fence);
    }

    pub fn is_finished(&self) -> bool {
        if self.error.is_some() && self.requests_in_flight == 0 {
            return true;
        }
        self.fence
            .as_ref()
            .is_some_and(|fence| fence.completed_value() >= 1)
    }

    fn take_outcome(&mut self) -> Result<DecompressedOutput, CozipDmaError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let tracking = self.tracking()?;
        let chunk_count = self.chunk_queued.len().saturating_sub(1);
        let required = if chunk_count == 0 { 0 } else { chunk_count + 1 };
        for slot in 0..required {
            if !self.chunk_queued[slot] {
                return Err(CozipDmaError::Internal("chunk was never dispatched"));
            }
            let code = tracking.load(slot).unwrap_or(DMA_STATUS_OK);
            if code != DMA_STATUS_OK {
                return Err(CozipDmaError::Codec { index: slot, code });
            }
        }

        let buffer = self
            .output
            .take()
            .ok_or(CozipDmaError::Internal("output buffer not allocated"))?
            .into_aligned()?;
        Ok(DecompressedOutput {
            buffer,
            len: self.decompressed_len,
            stats: ReadStats {
                bytes_read: self.bytes_read,
                block_count: self.block_count,
                chunk_count,
                aligned_reads: self.aligned_reads,
                peak_requests_in_flight: self.peak_in_flight,
                dispatches: std::mem::take(&mut self.dispatches),
            },
        })
    }

    /// Builds the outcome and hands it to the caller's completion path.
    pub fn deliver(mut self) -> bool {
        let outcome = self.take_outcome();
        let succeeded = outcome.is_ok();
        debug!(file = self.id, succeeded, "compressed read retired");
        if let Some(sink) = self.sink.take() {
            sink.deliver(outcome);
        }
        succeeded
    }
}

impl Drop for FileReadState {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.deliver(Err(CozipDmaError::ShutDown));
        }
    }
}
