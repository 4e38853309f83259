use std::sync::Arc;
use std::time::Duration;

use super::*;

fn patterned_data(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        data.push(((i as u32 * 31 + 7) % 251) as u8);
    }
    data
}

fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

fn small_block_options() -> StreamingOptions {
    StreamingOptions {
        read_block_size: 16 * 1024,
        unbuffered_alignment: 512,
        ..StreamingOptions::default()
    }
}

fn stream_for(input: &[u8], fragment_capacity: usize) -> Vec<u8> {
    let mut pool = FragmentPool::with_capacity(fragment_capacity).expect("pool should allocate");
    compress_to_stream(&mut SoftwareBackend::zlib(), &mut pool, input)
        .expect("compression should succeed")
        .0
}

#[test]
fn hardware_fragments_roundtrip() {
    let input = patterned_data(3 * 1024 * 1024 + 17);
    let device = DmaDevice::new();
    let queue = device
        .create_queue(QueueDesc::default())
        .expect("queue should start");
    let mut backend = DmaBackend::new(&device, queue);
    let mut pool = FragmentPool::with_capacity(1024 * 1024).expect("pool should allocate");

    let fragments =
        compress_fragmented(&mut backend, &mut pool, &input).expect("compression should succeed");
    assert_eq!(fragments.total_original(), input.len() as u64);
    assert!(fragments.len() >= 4);

    let dst = DmaBuffer::allocate(input.len()).expect("allocation should succeed");
    let produced = decompress_fragmented(&mut backend, &pool, &fragments, &dst)
        .expect("decompression should succeed");
    assert_eq!(produced, input.len());
    assert_eq!(dst.to_vec(produced).expect("copy out"), input);
}

#[test]
fn streamed_read_matches_reference_decoder() {
    let input = noise(200 * 1024 + 9);
    let stream = stream_for(&input, 64 * 1024);
    let reference =
        decode_compressed_stream(&stream, &ZlibCodec::default()).expect("reference decode");
    assert_eq!(reference, input);

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, small_block_options())
        .expect("context should start");
    let len = stream.len();
    let output = context
        .read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect("read should succeed");

    assert_eq!(output.bytes(), input.as_slice());
    assert_eq!(output.buffer.len() % DMA_MEMORY_ALLOCATION_SIZE, 0);
    assert!(output.buffer[output.len..].iter().all(|&byte| byte == 0));
    assert!(output.stats.chunk_count > 1);
    assert_eq!(output.stats.dispatches.len(), output.stats.chunk_count);
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn corrupt_payload_reports_failing_chunk() {
    let input = noise(150 * 1024);
    let mut stream = stream_for(&input, 64 * 1024);
    let header = CompressedFileHeader::parse(&stream).expect("header should parse");
    assert!(header.chunks.len() >= 2);

    let second_payload = header.encoded_len()
        + header.chunks[0].compressed_size.next_multiple_of(4) as usize;
    stream[second_payload] ^= 0xff;
    stream[second_payload + 1] ^= 0xff;

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, small_block_options())
        .expect("context should start");
    let len = stream.len();
    let error = context
        .read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect_err("corrupt chunk should fail");
    assert!(matches!(error, CozipDmaError::Codec { index: 1, .. }));
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn length_disagreeing_with_header_is_detected() {
    let input = noise(40 * 1024);
    let stream = stream_for(&input, 16 * 1024);

    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, small_block_options())
        .expect("context should start");
    let short = stream.len() - 4;
    let error = context
        .read_file_compressed(Arc::new(stream), 0, short, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect_err("mismatched length should fail");
    assert!(matches!(error, CozipDmaError::DataChecksum(_)));
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));
}

#[test]
fn reads_after_shutdown_are_refused() {
    let device = DmaDevice::new();
    let context = StreamingDma::init(&device, None, StreamingOptions::default())
        .expect("context should start");
    assert!(context.shutdown(Duration::from_secs(10)).expect("shutdown"));

    let error = context
        .read_file_compressed(Arc::new(vec![0u8; 16]), 0, 16, ReadOptions::default())
        .expect_err("closed context should refuse reads");
    assert!(matches!(error, CozipDmaError::ShutDown));
}
