use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use cozip_dma::{
    AlignedBuffer, ChunkEntry, CompressedFileHeader, CompressedSource, CozipDmaError,
    DMA_MEMORY_ALLOCATION_SIZE, DMA_STATUS_CORRUPT_STREAM, DMA_STATUS_SIZE_MISMATCH, DmaDevice,
    DmaKickoffBehavior, FragmentCodec, FragmentPool, ReadOptions, SoftwareBackend, StreamingDma,
    StreamingOptions, align_up, compress_file, compress_to_stream,
};

const POISON: u8 = 0xee;

/// Stores chunks verbatim and records every decode.
#[derive(Debug, Default)]
struct IdentityCodec {
    decoded: Mutex<Vec<usize>>,
}

impl IdentityCodec {
    fn decode_count(&self) -> usize {
        self.decoded.lock().expect("record lock").len()
    }
}

impl FragmentCodec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CozipDmaError> {
        Ok(src.to_vec())
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CozipDmaError> {
        self.decoded.lock().expect("record lock").push(src.len());
        if src.first() == Some(&POISON) {
            return Err(CozipDmaError::DataChecksum("poisoned chunk"));
        }
        if src.len() > dst.len() {
            return Err(CozipDmaError::DataChecksum("chunk larger than destination"));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

/// Builds a stream whose payloads are stored as-is. `original_sizes` may lie
/// about a payload's decoded length.
fn identity_stream(payloads: &[Vec<u8>], original_sizes: &[u32]) -> Vec<u8> {
    let header = CompressedFileHeader {
        chunks: payloads
            .iter()
            .zip(original_sizes)
            .map(|(payload, &original_size)| ChunkEntry {
                compressed_size: payload.len() as u32,
                original_size,
            })
            .collect(),
    };
    let mut out = Vec::new();
    header.write_to(&mut out).expect("header should encode");
    for payload in payloads {
        out.extend_from_slice(payload);
        out.resize(align_up(out.len(), 4), 0);
    }
    out
}

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"cozip-dma-streaming-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }

    out.truncate(bytes);
    out
}

fn zlib_stream(input: &[u8], fragment_capacity: usize) -> Vec<u8> {
    let mut pool = FragmentPool::with_capacity(fragment_capacity).expect("pool should allocate");
    compress_to_stream(&mut SoftwareBackend::zlib(), &mut pool, input)
        .expect("compression should succeed")
        .0
}

fn options(block: usize, alignment: usize) -> StreamingOptions {
    StreamingOptions {
        read_block_size: block,
        unbuffered_alignment: alignment,
        ..StreamingOptions::default()
    }
}

/// Holds each block's read until the test releases it.
struct GatedSource {
    data: Vec<u8>,
    block_size: usize,
    released: Mutex<HashSet<usize>>,
    opened: Condvar,
}

impl GatedSource {
    fn new(data: Vec<u8>, block_size: usize) -> Self {
        Self {
            data,
            block_size,
            released: Mutex::new(HashSet::new()),
            opened: Condvar::new(),
        }
    }

    fn release(&self, block: usize) {
        self.released.lock().expect("gate lock").insert(block);
        self.opened.notify_all();
    }
}

impl CompressedSource for GatedSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let block = offset as usize / self.block_size;
        let mut released = self.released.lock().expect("gate lock");
        while !released.contains(&block) {
            released = self.opened.wait(released).expect("gate lock");
        }
        drop(released);
        self.data.read_at(offset, buf)
    }
}

/// Rejects unaligned reads like a handle opened without buffering.
struct UnbufferedSource {
    data: Vec<u8>,
    alignment: usize,
    reads: Mutex<Vec<(u64, usize)>>,
}

impl CompressedSource for UnbufferedSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset % self.alignment as u64 != 0 || buf.len() % self.alignment != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unaligned unbuffered read",
            ));
        }
        self.reads.lock().expect("read log").push((offset, buf.len()));
        self.data.read_at(offset, buf)
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn chunks_dispatch_only_once_their_blocks_arrive() {
    // Block size 64: chunk 0 sits in block 0, chunk 1 spans blocks 0 to 2.
    let chunk0: Vec<u8> = (0..40u8).collect();
    let chunk1: Vec<u8> = (100..200u8).collect();
    let stream = identity_stream(&[chunk0.clone(), chunk1.clone()], &[40, 100]);
    assert_eq!(stream.len(), 160);

    let codec = Arc::new(IdentityCodec::default());
    let device = DmaDevice::with_codec(codec.clone());
    let context = StreamingDma::init(&device, None, options(64, 4)).expect("context should start");
    let source = Arc::new(GatedSource::new(stream, 64));
    let pending = context
        .read_file_compressed(source.clone(), 0, 160, ReadOptions::default())
        .expect("read should queue");

    source.release(0);
    assert!(wait_until(Duration::from_secs(10), || codec.decode_count() == 1));

    source.release(2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(codec.decode_count(), 1, "chunk 1 must wait for block 1");
    assert!(!pending.is_complete());

    source.release(1);
    let output = pending.wait().expect("read should succeed");

    let mut expected = chunk0;
    expected.extend_from_slice(&chunk1);
    assert_eq!(output.bytes(), expected.as_slice());
    assert_eq!(output.buffer.len(), DMA_MEMORY_ALLOCATION_SIZE);
    assert!(output.buffer[output.len..].iter().all(|&byte| byte == 0));

    let dispatches = &output.stats.dispatches;
    assert_eq!(dispatches.len(), 2);
    assert_eq!(dispatches[0].chunk, 0);
    assert!(!dispatches[0].completed_blocks.contains(&1));
    assert_eq!((dispatches[1].first_block, dispatches[1].last_block), (0, 2));
    for dispatch in dispatches {
        for block in dispatch.first_block..=dispatch.last_block {
            assert!(dispatch.completed_blocks.contains(&block));
        }
    }
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn unaligned_offset_is_rejected_before_queueing() {
    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, StreamingOptions::default())
        .expect("context should start");

    let error = context
        .read_file_compressed(Arc::new(vec![0u8; 64]), 2, 32, ReadOptions::default())
        .expect_err("offset 2 is not 4-byte aligned");
    assert!(matches!(error, CozipDmaError::InvalidArgument(_)));

    let error = context
        .read_file_compressed(Arc::new(vec![0u8; 64]), 0, 0, ReadOptions::default())
        .expect_err("empty reads are rejected");
    assert!(matches!(error, CozipDmaError::InvalidArgument(_)));

    assert_eq!(context.stats().files_submitted, 0);
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn offsets_past_the_file_range_leave_the_worker_running() {
    let input = build_mixed_dataset(12 * 1024);
    let stream = zlib_stream(&input, 4096);
    let unbuffered = || {
        Arc::new(UnbufferedSource {
            data: stream.clone(),
            alignment: 512,
            reads: Mutex::new(Vec::new()),
        })
    };

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, options(1024, 512))
        .expect("context should start");

    for offset in [u64::MAX - 3, (i64::MAX as u64 - 60) & !3] {
        let error = context
            .read_file_compressed(unbuffered(), offset, 64, ReadOptions::default())
            .expect_err("range past i64::MAX is refused");
        assert!(matches!(error, CozipDmaError::InvalidArgument(_)));
    }
    assert_eq!(context.stats().files_submitted, 0);

    // Accepted, but the aligned retry lands past the end of the data.
    let far = (i64::MAX as u64 & !511) - 4096 + 4;
    let result = context
        .read_file_compressed(unbuffered(), far, 64, ReadOptions::default())
        .expect("in-range offset should queue")
        .wait_timeout(Duration::from_secs(10))
        .expect("read should finish");
    assert!(matches!(result, Err(CozipDmaError::Io(_))));

    let output = context
        .read_file_compressed(unbuffered(), 0, stream.len(), ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect("worker should still serve reads");
    assert_eq!(output.bytes(), input.as_slice());
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn unbuffered_handle_switches_to_aligned_reads() {
    let input = build_mixed_dataset(48 * 1024 + 5);
    let stream = zlib_stream(&input, 4096);
    let offset = 4100usize;

    let mut data = vec![0x5a; offset];
    data.extend_from_slice(&stream);
    data.resize(align_up(data.len(), 512) + 512, 0);
    let source = Arc::new(UnbufferedSource {
        data,
        alignment: 512,
        reads: Mutex::new(Vec::new()),
    });

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, options(1024, 512))
        .expect("context should start");
    let output = context
        .read_file_compressed(source.clone(), offset as u64, stream.len(), ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect("aligned retry should succeed");

    assert_eq!(output.bytes(), input.as_slice());
    assert!(output.stats.aligned_reads);
    let reads = source.reads.lock().expect("read log");
    assert!(!reads.is_empty());
    assert!(reads.iter().all(|&(at, len)| at % 512 == 0 && len % 512 == 0));
    drop(reads);
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn failing_chunk_is_reported_to_callback_and_handle() {
    let payloads: Vec<Vec<u8>> = (0..5u8)
        .map(|chunk| {
            let mut payload = vec![chunk; 48];
            if chunk == 2 {
                payload[0] = POISON;
            }
            payload
        })
        .collect();
    let stream = identity_stream(&payloads, &[48; 5]);

    let device = DmaDevice::with_codec(Arc::new(IdentityCodec::default()));
    let context = StreamingDma::init(&device, None, options(64, 4)).expect("context should start");
    let seen = Arc::new(Mutex::new(None));
    let callback_seen = Arc::clone(&seen);
    let len = stream.len();
    let error = context
        .read_file_compressed(
            Arc::new(stream),
            0,
            len,
            ReadOptions::default().with_completion(move |outcome| {
                if let Err(CozipDmaError::Codec { index, code }) = outcome {
                    *callback_seen.lock().expect("callback lock") = Some((*index, *code));
                }
            }),
        )
        .expect("read should queue")
        .wait()
        .expect_err("poisoned chunk should fail");

    assert!(matches!(
        error,
        CozipDmaError::Codec {
            index: 2,
            code: DMA_STATUS_CORRUPT_STREAM
        }
    ));
    assert_eq!(
        *seen.lock().expect("callback lock"),
        Some((2, DMA_STATUS_CORRUPT_STREAM))
    );
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn short_chunk_is_a_size_mismatch() {
    let stream = identity_stream(&[vec![1u8; 32], vec![2u8; 100]], &[32, 120]);

    let device = DmaDevice::with_codec(Arc::new(IdentityCodec::default()));
    let context = StreamingDma::init(&device, None, options(64, 4)).expect("context should start");
    let len = stream.len();
    let error = context
        .read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect_err("header lies about chunk 1");
    assert!(matches!(
        error,
        CozipDmaError::Codec {
            index: 1,
            code: DMA_STATUS_SIZE_MISMATCH
        }
    ));
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn compressed_file_streams_back_from_disk() {
    let dir = std::env::temp_dir();
    let src_path = dir.join(format!("cozip_dma_src_{}", std::process::id()));
    let dst_path = dir.join(format!("cozip_dma_dst_{}", std::process::id()));
    let input = build_mixed_dataset(300 * 1024 + 11);
    std::fs::write(&src_path, &input).expect("write source file");

    let mut pool = FragmentPool::with_capacity(64 * 1024).expect("pool should allocate");
    let stats = compress_file(&mut SoftwareBackend::zlib(), &mut pool, &src_path, &dst_path)
        .expect("compress_file should succeed");
    assert_eq!(stats.original_len, input.len() as u64);

    let file = std::fs::File::open(&dst_path).expect("open compressed file");
    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, options(32 * 1024, 4096))
        .expect("context should start");
    let output = context
        .read_file_compressed(
            Arc::new(file),
            0,
            stats.stream_len as usize,
            ReadOptions::default(),
        )
        .expect("read should queue")
        .wait()
        .expect("read should succeed");

    assert_eq!(output.bytes(), input.as_slice());
    assert_eq!(crc32fast::hash(output.bytes()), stats.original_crc32);
    assert_eq!(output.stats.chunk_count, stats.chunk_count);
    assert!(!output.stats.aligned_reads);
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));

    let _ = std::fs::remove_file(&src_path);
    let _ = std::fs::remove_file(&dst_path);
}

#[test]
fn explicit_tick_holds_ready_chunks() {
    let input = build_mixed_dataset(20 * 1024);
    let stream = zlib_stream(&input, 4096);

    let device = DmaDevice::new();
    let context = StreamingDma::init(
        &device,
        None,
        StreamingOptions {
            kickoff: DmaKickoffBehavior::ExplicitTick,
            ..options(4096, 512)
        },
    )
    .expect("context should start");
    let len = stream.len();
    let pending = context
        .read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
        .expect("read should queue");

    assert!(pending.wait_timeout(Duration::from_millis(100)).is_none());

    let deadline = Instant::now() + Duration::from_secs(10);
    let output = loop {
        context.explicit_tick().expect("tick should be accepted");
        if let Some(outcome) = pending.wait_timeout(Duration::from_millis(20)) {
            break outcome.expect("read should succeed");
        }
        assert!(Instant::now() < deadline, "read never completed");
    };
    assert_eq!(output.bytes(), input.as_slice());
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn tick_is_refused_in_immediate_mode() {
    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, StreamingOptions::default())
        .expect("context should start");
    assert!(matches!(
        context.explicit_tick(),
        Err(CozipDmaError::InvalidArgument(_))
    ));
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn custom_allocator_receives_rounded_size() {
    let input = build_mixed_dataset(70_000);
    let stream = zlib_stream(&input, 16 * 1024);
    let requested = Arc::new(AtomicUsize::new(0));
    let record = Arc::clone(&requested);

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, options(8192, 512))
        .expect("context should start");
    let len = stream.len();
    let output = context
        .read_file_compressed(
            Arc::new(stream.clone()),
            0,
            len,
            ReadOptions::default().with_allocator(move |size| {
                record.store(size, Ordering::SeqCst);
                AlignedBuffer::zeroed(size).ok()
            }),
        )
        .expect("read should queue")
        .wait()
        .expect("read should succeed");
    assert_eq!(output.bytes(), input.as_slice());
    assert_eq!(
        requested.load(Ordering::SeqCst),
        align_up(input.len(), DMA_MEMORY_ALLOCATION_SIZE)
    );

    let error = context
        .read_file_compressed(
            Arc::new(stream),
            0,
            len,
            ReadOptions::default().with_allocator(|_| None),
        )
        .expect("read should queue")
        .wait()
        .expect_err("refused allocation should fail the read");
    assert!(matches!(error, CozipDmaError::OutOfMemory(_)));
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn empty_stream_completes_without_chunks() {
    let stream = identity_stream(&[], &[]);
    assert_eq!(stream.len(), 4);

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, options(64, 4)).expect("context should start");
    let output = context
        .read_file_compressed(Arc::new(stream), 0, 4, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect("empty stream should succeed");
    assert_eq!(output.len, 0);
    assert_eq!(output.stats.chunk_count, 0);
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn concurrent_files_respect_queue_depth() {
    let device = DmaDevice::new();
    let context = StreamingDma::init(
        &device,
        None,
        StreamingOptions {
            max_concurrent_requests: 3,
            max_queue_depth_per_file: 2,
            ..options(1024, 512)
        },
    )
    .expect("context should start");

    let inputs: Vec<Vec<u8>> = (0..6)
        .map(|index| build_mixed_dataset(16 * 1024 + index * 333))
        .collect();
    let pending: Vec<_> = inputs
        .iter()
        .map(|input| {
            let stream = zlib_stream(input, 4096);
            let len = stream.len();
            context
                .read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
                .expect("read should queue")
        })
        .collect();

    for (input, pending) in inputs.iter().zip(pending) {
        let output = pending.wait().expect("read should succeed");
        assert_eq!(output.bytes(), input.as_slice());
        assert!(output.stats.peak_requests_in_flight <= 2);
        assert!(output.stats.block_count > 1);
    }

    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
    let stats = context.stats();
    assert_eq!(stats.files_submitted, 6);
    assert_eq!(stats.files_completed, 6);
    assert_eq!(stats.files_in_flight, 0);
    assert!(context.shutdown(Duration::from_secs(1)).expect("second shutdown"));
}
