use std::sync::Arc;
use std::time::Duration;

use cozip_dma::{
    CozipDmaError, DmaDevice, FragmentPool, ReadOptions, SoftwareBackend, StreamingOptions,
    compress_to_stream, init_streaming_dma, read_file_compressed, shutdown_streaming_dma,
    streaming_dma_explicit_tick,
};

// The process-wide context is shared by every test in this binary, so the
// whole lifecycle runs in one test.
#[test]
fn global_context_lifecycle() {
    assert!(shutdown_streaming_dma(Duration::from_secs(1)).expect("nothing to shut down"));
    assert!(matches!(
        read_file_compressed(Arc::new(vec![0u8; 8]), 0, 8, ReadOptions::default()),
        Err(CozipDmaError::NotInitialized)
    ));
    assert!(matches!(
        streaming_dma_explicit_tick(),
        Err(CozipDmaError::NotInitialized)
    ));

    let device = DmaDevice::new();
    init_streaming_dma(&device, None, StreamingOptions::default()).expect("first init");
    assert!(matches!(
        init_streaming_dma(&device, None, StreamingOptions::default()),
        Err(CozipDmaError::AlreadyInitialized)
    ));

    let input = b"global-context-".repeat(4096);
    let mut pool = FragmentPool::with_capacity(16 * 1024).expect("pool should allocate");
    let (stream, _) = compress_to_stream(&mut SoftwareBackend::zlib(), &mut pool, &input)
        .expect("compression should succeed");
    let len = stream.len();
    let output = read_file_compressed(Arc::new(stream), 0, len, ReadOptions::default())
        .expect("read should queue")
        .wait()
        .expect("read should succeed");
    assert_eq!(output.bytes(), input.as_slice());

    assert!(shutdown_streaming_dma(Duration::from_secs(10)).expect("shutdown"));
    assert!(matches!(
        read_file_compressed(Arc::new(vec![0u8; 8]), 0, 8, ReadOptions::default()),
        Err(CozipDmaError::NotInitialized)
    ));

    init_streaming_dma(&device, None, StreamingOptions::default()).expect("re-init after shutdown");
    assert!(shutdown_streaming_dma(Duration::from_secs(10)).expect("second shutdown"));
}

#[test]
fn invalid_options_are_rejected() {
    let options = StreamingOptions {
        max_concurrent_requests: 0,
        ..StreamingOptions::default()
    };
    let device = DmaDevice::new();
    assert!(matches!(
        cozip_dma::StreamingDma::init(&device, None, options),
        Err(CozipDmaError::InvalidOptions(_))
    ));
}
