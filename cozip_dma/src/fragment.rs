use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::codec::{FragmentCodec, ZlibCodec, ZopfliCodec};
use crate::dma::{
    DMA_STATUS_CORRUPT_STREAM, DMA_STATUS_SIZE_MISMATCH, DmaCommandList, DmaDevice, DmaQueue,
    ErrorCodePage, FrameSync, SourceBytes,
};
use crate::memory::{DmaBuffer, FragmentPool};
use crate::{CozipDmaError, FRAGMENT_PREFIX_LEN, MAX_SHRINK_ATTEMPTS, read_u32};

const SHRINK_MARGIN: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionOption {
    DmaHardware,
    SoftwareZlib,
    SoftwareZopfli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub compressed_size: u32,
    pub original_size: u32,
    pub shrink_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentSet {
    pub fragments: Vec<FragmentInfo>,
}

impl FragmentSet {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn total_original(&self) -> u64 {
        self.fragments
            .iter()
            .map(|info| u64::from(info.original_size))
            .sum()
    }

    pub fn total_compressed(&self) -> u64 {
        self.fragments
            .iter()
            .map(|info| u64::from(info.compressed_size))
            .sum()
    }
}

/// One way of turning slices into fragments and back.
///
/// Immediate backends finish each call before returning. Deferred backends
/// only record work; nothing they produce may be read before
/// `submit_and_wait` returns `Ok`.
pub trait FragmentBackend: Send {
    fn option(&self) -> CompressionOption;

    /// Deferred backends cannot report sizes per call, so they compress fixed
    /// slices that always fit.
    fn fixed_slice_len(&self, _fragment_capacity: usize) -> Option<usize> {
        None
    }

    fn begin_batch(&mut self, _fragment_count: usize) -> Result<(), CozipDmaError> {
        Ok(())
    }

    /// Returns the fragment bytes needed (prefix included), or `None` when the
    /// work was only recorded. Output that does not fit is not written.
    fn compress_fragment(
        &mut self,
        index: usize,
        fragment: &DmaBuffer,
        src: &[u8],
    ) -> Result<Option<usize>, CozipDmaError>;

    fn decompress_fragment(
        &mut self,
        index: usize,
        fragment: &DmaBuffer,
        dst: &DmaBuffer,
        dst_range: Range<usize>,
    ) -> Result<(), CozipDmaError>;

    fn submit_and_wait(&mut self) -> Result<(), CozipDmaError>;
}

#[derive(Debug, Clone)]
pub struct SoftwareBackend {
    option: CompressionOption,
    codec: Arc<dyn FragmentCodec>,
}

impl SoftwareBackend {
    pub fn zlib() -> Self {
        Self::with_codec(CompressionOption::SoftwareZlib, Arc::new(ZlibCodec::default()))
    }

    pub fn zopfli() -> Self {
        Self::with_codec(
            CompressionOption::SoftwareZopfli,
            Arc::new(ZopfliCodec::default()),
        )
    }

    pub fn with_codec(option: CompressionOption, codec: Arc<dyn FragmentCodec>) -> Self {
        Self { option, codec }
    }
}

impl FragmentBackend for SoftwareBackend {
    fn option(&self) -> CompressionOption {
        self.option
    }

    fn compress_fragment(
        &mut self,
        _index: usize,
        fragment: &DmaBuffer,
        src: &[u8],
    ) -> Result<Option<usize>, CozipDmaError> {
        let stream = self.codec.compress(src)?;
        let required = FRAGMENT_PREFIX_LEN + stream.len();
        if required <= fragment.len() {
            let size = u32::try_from(stream.len()).map_err(|_| CozipDmaError::DataTooLarge)?;
            let mut guard = fragment.lock()?;
            guard[..FRAGMENT_PREFIX_LEN].copy_from_slice(&size.to_le_bytes());
            guard[FRAGMENT_PREFIX_LEN..required].copy_from_slice(&stream);
        }
        Ok(Some(required))
    }

    fn decompress_fragment(
        &mut self,
        index: usize,
        fragment: &DmaBuffer,
        dst: &DmaBuffer,
        dst_range: Range<usize>,
    ) -> Result<(), CozipDmaError> {
        if fragment.same_buffer(dst) {
            return Err(CozipDmaError::InvalidArgument(
                "fragment and destination must differ",
            ));
        }
        let source = fragment.lock()?;
        let size = read_u32(&source, 0)? as usize;
        let payload = source
            .get(FRAGMENT_PREFIX_LEN..FRAGMENT_PREFIX_LEN + size)
            .ok_or(CozipDmaError::InvalidFrame("fragment size prefix exceeds capacity"))?;

        let mut out = dst.lock()?;
        let expected = dst_range.len();
        let target = out
            .get_mut(dst_range)
            .ok_or(CozipDmaError::InvalidArgument("destination range out of bounds"))?;

        let written = self.codec.decompress(payload, target).map_err(|err| {
            warn!(index, codec = self.codec.name(), %err, "fragment decompression failed");
            CozipDmaError::Codec {
                index,
                code: DMA_STATUS_CORRUPT_STREAM,
            }
        })?;
        if written != expected {
            warn!(index, written, expected, "fragment decompressed to unexpected size");
            return Err(CozipDmaError::Codec {
                index,
                code: DMA_STATUS_SIZE_MISMATCH,
            });
        }
        Ok(())
    }

    fn submit_and_wait(&mut self) -> Result<(), CozipDmaError> {
        Ok(())
    }
}

/// Transfer-engine backend: every fragment of a batch goes onto one command
/// list with its own error slot, then one submit and fence wait.
#[derive(Debug)]
pub struct DmaBackend {
    queue: Arc<DmaQueue>,
    list: DmaCommandList,
    sync: FrameSync,
    errors: Arc<ErrorCodePage>,
    recorded: usize,
}

impl DmaBackend {
    pub fn new(device: &DmaDevice, queue: Arc<DmaQueue>) -> Self {
        Self {
            queue,
            list: device.create_command_list(),
            sync: FrameSync::new(device),
            errors: ErrorCodePage::new(0),
            recorded: 0,
        }
    }

    fn record_error_slot(&mut self, index: usize) -> Result<(), CozipDmaError> {
        if index >= self.errors.len() {
            return Err(CozipDmaError::Internal(
                "fragment index outside of the current batch",
            ));
        }
        self.list
            .copy_last_error_code(Arc::clone(&self.errors), index)?;
        self.recorded = self.recorded.max(index + 1);
        Ok(())
    }
}

impl FragmentBackend for DmaBackend {
    fn option(&self) -> CompressionOption {
        CompressionOption::DmaHardware
    }

    fn fixed_slice_len(&self, fragment_capacity: usize) -> Option<usize> {
        Some((fragment_capacity / 4 * 3) & !3)
    }

    fn begin_batch(&mut self, fragment_count: usize) -> Result<(), CozipDmaError> {
        self.list.reset();
        self.errors = ErrorCodePage::new(fragment_count);
        self.recorded = 0;
        Ok(())
    }

    fn compress_fragment(
        &mut self,
        index: usize,
        fragment: &DmaBuffer,
        src: &[u8],
    ) -> Result<Option<usize>, CozipDmaError> {
        self.list
            .lz_compress(fragment.clone(), SourceBytes::owned(src))?;
        self.record_error_slot(index)?;
        Ok(None)
    }

    fn decompress_fragment(
        &mut self,
        index: usize,
        fragment: &DmaBuffer,
        dst: &DmaBuffer,
        dst_range: Range<usize>,
    ) -> Result<(), CozipDmaError> {
        let size = fragment.read_u32(0)? as usize;
        if FRAGMENT_PREFIX_LEN + size > fragment.len() {
            return Err(CozipDmaError::InvalidFrame(
                "fragment size prefix exceeds capacity",
            ));
        }
        self.list.lz_decompress(
            dst.clone(),
            dst_range,
            SourceBytes::Buffer {
                buffer: fragment.clone(),
                range: FRAGMENT_PREFIX_LEN..FRAGMENT_PREFIX_LEN + size,
            },
        )?;
        self.record_error_slot(index)
    }

    fn submit_and_wait(&mut self) -> Result<(), CozipDmaError> {
        if self.list.is_empty() {
            return Ok(());
        }
        self.list.close();
        self.queue.execute(&mut self.list)?;
        self.sync.wait_for_frame(&self.queue, Some(&mut self.list))?;

        if let Some((index, code)) = self.errors.first_error(self.recorded) {
            warn!(index, code, "transfer engine reported an error");
            return Err(CozipDmaError::Codec { index, code });
        }
        Ok(())
    }
}

/// Next slice length after an overflow: scaled by the overflow ratio with a
/// 10% margin, truncated to a multiple of 4.
pub fn shrink_slice_len(prospective: usize, required: usize, capacity: usize) -> usize {
    let ratio = required as f64 / capacity as f64;
    ((prospective as f64 / ratio) * SHRINK_MARGIN) as usize & !3
}

/// Splits `src` into fragments that each fit the pool's capacity.
pub fn compress_fragmented(
    backend: &mut dyn FragmentBackend,
    pool: &mut FragmentPool,
    src: &[u8],
) -> Result<FragmentSet, CozipDmaError> {
    let capacity = pool.fragment_capacity();
    if let Some(slice_len) = backend.fixed_slice_len(capacity) {
        return compress_fixed_slices(backend, pool, src, slice_len);
    }

    let mut set = FragmentSet::default();
    let mut offset = 0;
    let mut prospective = src.len();

    while offset < src.len() {
        let index = set.len();
        let fragment = pool.ensure_capacity(index)?.clone();
        prospective = prospective.min(src.len() - offset);

        let mut retries = 0;
        let mut required =
            compress_measured(backend, index, &fragment, &src[offset..offset + prospective])?;
        while required > capacity {
            let next = shrink_slice_len(prospective, required, capacity);
            if retries >= MAX_SHRINK_ATTEMPTS || next == 0 {
                return Err(CozipDmaError::FragmentOverflow {
                    index,
                    slice_len: prospective,
                    capacity,
                });
            }
            trace!(index, prospective, required, next, "fragment overflow, shrinking slice");
            prospective = next;
            retries += 1;
            required =
                compress_measured(backend, index, &fragment, &src[offset..offset + prospective])?;
        }

        let original_size = u32::try_from(prospective).map_err(|_| CozipDmaError::DataTooLarge)?;
        pool.set_original_size(index, original_size)?;
        set.fragments.push(FragmentInfo {
            compressed_size: (required - FRAGMENT_PREFIX_LEN) as u32,
            original_size,
            shrink_retries: retries,
        });
        offset += prospective;
    }

    backend.submit_and_wait()?;
    debug!(
        option = ?backend.option(),
        fragments = set.len(),
        original = src.len(),
        compressed = set.total_compressed(),
        "fragmented compression finished"
    );
    Ok(set)
}

fn compress_measured(
    backend: &mut dyn FragmentBackend,
    index: usize,
    fragment: &DmaBuffer,
    src: &[u8],
) -> Result<usize, CozipDmaError> {
    backend
        .compress_fragment(index, fragment, src)?
        .ok_or(CozipDmaError::Internal(
            "deferred backend must use fixed slices",
        ))
}

fn compress_fixed_slices(
    backend: &mut dyn FragmentBackend,
    pool: &mut FragmentPool,
    src: &[u8],
    slice_len: usize,
) -> Result<FragmentSet, CozipDmaError> {
    if slice_len == 0 {
        return Err(CozipDmaError::InvalidOptions("fixed slice length must be non-zero"));
    }
    let count = src.len().div_ceil(slice_len);
    backend.begin_batch(count)?;

    for (index, slice) in src.chunks(slice_len).enumerate() {
        let fragment = pool.ensure_capacity(index)?.clone();
        backend.compress_fragment(index, &fragment, slice)?;
        pool.set_original_size(index, slice.len() as u32)?;
    }
    backend.submit_and_wait()?;

    let mut set = FragmentSet::default();
    for index in 0..count {
        set.fragments.push(FragmentInfo {
            compressed_size: pool.compressed_size(index)?,
            original_size: pool
                .original_size(index)
                .ok_or(CozipDmaError::Internal("fragment slot missing"))?,
            shrink_retries: 0,
        });
    }
    debug!(option = ?backend.option(), fragments = count, "fixed-slice compression finished");
    Ok(set)
}

/// Reassembles fragments into `dst`, in order. Returns the bytes produced.
pub fn decompress_fragmented(
    backend: &mut dyn FragmentBackend,
    pool: &FragmentPool,
    fragments: &FragmentSet,
    dst: &DmaBuffer,
) -> Result<usize, CozipDmaError> {
    let total =
        usize::try_from(fragments.total_original()).map_err(|_| CozipDmaError::DataTooLarge)?;
    if dst.len() < total {
        return Err(CozipDmaError::InvalidArgument(
            "destination smaller than the fragments' original size",
        ));
    }

    backend.begin_batch(fragments.len())?;
    let mut offset = 0;
    for (index, info) in fragments.fragments.iter().enumerate() {
        let fragment = pool
            .fragment(index)
            .ok_or(CozipDmaError::InvalidArgument("fragment missing from pool"))?;
        let end = offset + info.original_size as usize;
        backend.decompress_fragment(index, fragment, dst, offset..end)?;
        offset = end;
    }
    backend.submit_and_wait()?;
    Ok(total)
}

pub fn chunked_compress_with_zlib(
    pool: &mut FragmentPool,
    src: &[u8],
) -> Result<FragmentSet, CozipDmaError> {
    compress_fragmented(&mut SoftwareBackend::zlib(), pool, src)
}

pub fn chunked_compress_with_zopfli(
    pool: &mut FragmentPool,
    src: &[u8],
) -> Result<FragmentSet, CozipDmaError> {
    compress_fragmented(&mut SoftwareBackend::zopfli(), pool, src)
}
