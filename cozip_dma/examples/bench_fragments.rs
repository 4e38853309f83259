use std::sync::Arc;
use std::time::{Duration, Instant};

use cozip_dma::{
    CompressionOption, CompressionWorkbench, DmaDevice, FragmentPool, ReadOptions,
    SoftwareBackend, StreamingDma, StreamingOptions, WorkbenchSettings, compress_to_stream,
};

#[derive(Debug, Clone, Default)]
struct BenchAgg {
    compress_total: Duration,
    decompress_total: Duration,
    compressed_total: u64,
    input_total: usize,
    fragments: usize,
}

impl BenchAgg {
    fn avg_compress_ms(&self, iters: usize) -> f64 {
        self.compress_total.as_secs_f64() * 1000.0 / iters as f64
    }

    fn avg_decompress_ms(&self, iters: usize) -> f64 {
        self.decompress_total.as_secs_f64() * 1000.0 / iters as f64
    }

    fn ratio(&self) -> f64 {
        if self.input_total == 0 {
            return 0.0;
        }
        self.compressed_total as f64 / self.input_total as f64
    }

    fn decompress_mib_s(&self) -> f64 {
        if self.decompress_total.is_zero() {
            return 0.0;
        }
        (self.input_total as f64 / (1024.0 * 1024.0)) / self.decompress_total.as_secs_f64()
    }
}

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"cozip-dma-fragments-"),
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

fn run_workbench(
    device: &DmaDevice,
    input: Arc<[u8]>,
    option: CompressionOption,
    iters: usize,
) -> BenchAgg {
    let settings = WorkbenchSettings {
        option,
        hardware_decompression: true,
        current_file: 0,
    };
    let workbench = CompressionWorkbench::spawn(device, vec![input], settings)
        .expect("workbench should start");

    let mut agg = BenchAgg::default();
    let mut generation = 0;
    for _ in 0..iters {
        let report = workbench
            .wait_for_report(generation, Duration::from_secs(600))
            .expect("wait should succeed")
            .expect("report should arrive");
        assert!(report.verified, "round trip failed: {:?}", report.failure);
        generation = report.generation;
        agg.compress_total += report.compress_time;
        agg.decompress_total += report.decompress_time;
        agg.compressed_total += report.compressed_size;
        agg.input_total += report.original_size;
        agg.fragments = report.fragment_count;
    }
    workbench.stop().expect("workbench should stop");
    agg
}

fn run_streaming(device: &DmaDevice, input: &[u8], iters: usize) -> BenchAgg {
    let mut pool = FragmentPool::new();
    let (stream, stats) = compress_to_stream(&mut SoftwareBackend::zlib(), &mut pool, input)
        .expect("compression should succeed");
    let stream = Arc::new(stream);
    let context = StreamingDma::init(device, None, StreamingOptions::default())
        .expect("streaming context should start");

    let mut agg = BenchAgg {
        fragments: stats.chunk_count,
        ..BenchAgg::default()
    };
    for _ in 0..iters {
        let start = Instant::now();
        let output = context
            .read_file_compressed(stream.clone(), 0, stream.len(), ReadOptions::default())
            .expect("read should queue")
            .wait()
            .expect("read should succeed");
        agg.decompress_total += start.elapsed();
        assert_eq!(output.bytes(), input);
        agg.compressed_total += stats.stream_len;
        agg.input_total += input.len();
    }
    context
        .shutdown(Duration::from_secs(30))
        .expect("shutdown should succeed");
    agg
}

fn main() {
    let sizes = [4 * 1024 * 1024, 16 * 1024 * 1024];
    let iters = 3;
    let device = DmaDevice::new();

    println!("cozip_dma benchmark (release)");
    println!("iters={}", iters);
    println!("sizes={:?}", sizes);

    for size in sizes {
        let input: Arc<[u8]> = build_mixed_dataset(size).into();
        let mib = size as f64 / (1024.0 * 1024.0);

        println!();
        println!("size_bytes={} ({:.1} MiB)", size, mib);
        for option in [CompressionOption::DmaHardware, CompressionOption::SoftwareZlib] {
            let agg = run_workbench(&device, Arc::clone(&input), option, iters);
            println!(
                "{:?}: avg_comp_ms={:.3} avg_decomp_ms={:.3} decomp_mib_s={:.2} ratio={:.4} fragments={}",
                option,
                agg.avg_compress_ms(iters),
                agg.avg_decompress_ms(iters),
                agg.decompress_mib_s(),
                agg.ratio(),
                agg.fragments,
            );
        }

        let streamed = run_streaming(&device, &input, iters);
        println!(
            "Streaming: avg_read_ms={:.3} read_mib_s={:.2} ratio={:.4} chunks={}",
            streamed.avg_decompress_ms(iters),
            streamed.decompress_mib_s(),
            streamed.ratio(),
            streamed.fragments,
        );
    }
}
