use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::dma::{DmaDevice, QueueDesc};
use crate::fragment::{
    CompressionOption, DmaBackend, FragmentBackend, SoftwareBackend, compress_fragmented,
    decompress_fragmented,
};
use crate::memory::{DmaBuffer, FragmentPool};
use crate::{CozipDmaError, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkbenchSettings {
    pub option: CompressionOption,
    pub hardware_decompression: bool,
    pub current_file: usize,
}

impl Default for WorkbenchSettings {
    fn default() -> Self {
        Self {
            option: CompressionOption::DmaHardware,
            hardware_decompression: true,
            current_file: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkbenchReport {
    pub generation: u64,
    pub settings: WorkbenchSettings,
    pub original_size: usize,
    pub compressed_size: u64,
    pub fragment_count: usize,
    pub compress_time: Duration,
    pub decompress_time: Duration,
    pub verified: bool,
    pub failure: Option<String>,
    pub output: Arc<[u8]>,
}

#[derive(Debug)]
struct WorkbenchState {
    settings: WorkbenchSettings,
    report: Option<WorkbenchReport>,
    generation: u64,
}

#[derive(Debug)]
struct WorkbenchShared {
    state: Mutex<WorkbenchState>,
    published: Condvar,
    exit: AtomicBool,
    file_count: usize,
}

struct Backends {
    dma_compress: DmaBackend,
    dma_decompress: DmaBackend,
    zlib: SoftwareBackend,
    zopfli: SoftwareBackend,
}

impl Backends {
    fn compressor(&mut self, option: CompressionOption) -> &mut dyn FragmentBackend {
        match option {
            CompressionOption::DmaHardware => &mut self.dma_compress,
            CompressionOption::SoftwareZlib => &mut self.zlib,
            CompressionOption::SoftwareZopfli => &mut self.zopfli,
        }
    }

    // Zopfli output is plain zlib, so one software decoder covers both.
    fn decompressor(&mut self, hardware: bool) -> &mut dyn FragmentBackend {
        if hardware {
            &mut self.dma_decompress
        } else {
            &mut self.zlib
        }
    }
}

/// Background thread that repeatedly compresses and decompresses the selected
/// input and publishes timings for a consumer thread.
#[derive(Debug)]
pub struct CompressionWorkbench {
    shared: Arc<WorkbenchShared>,
    handle: Option<JoinHandle<()>>,
}

impl CompressionWorkbench {
    pub fn spawn(
        device: &DmaDevice,
        files: Vec<Arc<[u8]>>,
        settings: WorkbenchSettings,
    ) -> Result<Self, CozipDmaError> {
        if files.is_empty() {
            return Err(CozipDmaError::InvalidArgument("workbench needs at least one input"));
        }
        if settings.current_file >= files.len() {
            return Err(CozipDmaError::InvalidArgument("current_file out of range"));
        }

        let backends = Backends {
            dma_compress: DmaBackend::new(
                device,
                device.create_queue(QueueDesc { engine_index: 2 })?,
            ),
            dma_decompress: DmaBackend::new(
                device,
                device.create_queue(QueueDesc { engine_index: 3 })?,
            ),
            zlib: SoftwareBackend::zlib(),
            zopfli: SoftwareBackend::zopfli(),
        };
        let shared = Arc::new(WorkbenchShared {
            state: Mutex::new(WorkbenchState {
                settings,
                report: None,
                generation: 0,
            }),
            published: Condvar::new(),
            exit: AtomicBool::new(false),
            file_count: files.len(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("cozip-dma-workbench".to_string())
            .spawn(move || run_workbench(thread_shared, files, backends))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn settings(&self) -> Result<WorkbenchSettings, CozipDmaError> {
        Ok(lock(&self.shared.state)?.settings)
    }

    /// A pass already running under the old settings is discarded.
    pub fn set_settings(&self, settings: WorkbenchSettings) -> Result<(), CozipDmaError> {
        if settings.current_file >= self.shared.file_count {
            return Err(CozipDmaError::InvalidArgument("current_file out of range"));
        }
        lock(&self.shared.state)?.settings = settings;
        Ok(())
    }

    pub fn latest_report(&self) -> Result<Option<WorkbenchReport>, CozipDmaError> {
        Ok(lock(&self.shared.state)?.report.clone())
    }

    /// Waits for a report with a generation above `after`.
    pub fn wait_for_report(
        &self,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<WorkbenchReport>, CozipDmaError> {
        let guard = lock(&self.shared.state)?;
        let (guard, _) = self
            .shared
            .published
            .wait_timeout_while(guard, timeout, |state| state.generation <= after)
            .map_err(|_| CozipDmaError::Internal("mutex poisoned"))?;
        Ok(guard
            .report
            .as_ref()
            .filter(|report| report.generation > after)
            .cloned())
    }

    pub fn stop(mut self) -> Result<(), CozipDmaError> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> Result<(), CozipDmaError> {
        self.shared.exit.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| CozipDmaError::Internal("workbench thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for CompressionWorkbench {
    fn drop(&mut self) {
        let _ = self.stop_thread();
    }
}

fn run_workbench(shared: Arc<WorkbenchShared>, files: Vec<Arc<[u8]>>, mut backends: Backends) {
    let mut pool = FragmentPool::new();
    while !shared.exit.load(Ordering::Acquire) {
        let Ok(settings) = lock(&shared.state).map(|state| state.settings) else {
            return;
        };
        let input = &files[settings.current_file];
        let mut report = run_pass(&mut backends, &mut pool, settings, input);

        let Ok(mut state) = lock(&shared.state) else {
            return;
        };
        if state.settings != settings {
            debug!("workbench settings changed mid-pass, result discarded");
            continue;
        }
        state.generation += 1;
        report.generation = state.generation;
        state.report = Some(report);
        shared.published.notify_all();
    }
}

fn run_pass(
    backends: &mut Backends,
    pool: &mut FragmentPool,
    settings: WorkbenchSettings,
    input: &[u8],
) -> WorkbenchReport {
    let mut report = WorkbenchReport {
        generation: 0,
        settings,
        original_size: input.len(),
        compressed_size: 0,
        fragment_count: 0,
        compress_time: Duration::ZERO,
        decompress_time: Duration::ZERO,
        verified: false,
        failure: None,
        output: Arc::from(Vec::new()),
    };

    let start = Instant::now();
    let fragments = match compress_fragmented(backends.compressor(settings.option), pool, input) {
        Ok(fragments) => fragments,
        Err(error) => {
            warn!(option = ?settings.option, %error, "workbench compression failed");
            report.failure = Some(error.to_string());
            return report;
        }
    };
    report.compress_time = start.elapsed();
    report.compressed_size = fragments.total_compressed();
    report.fragment_count = fragments.len();

    let decoded = DmaBuffer::allocate(input.len()).and_then(|dst| {
        let start = Instant::now();
        decompress_fragmented(
            backends.decompressor(settings.hardware_decompression),
            pool,
            &fragments,
            &dst,
        )?;
        Ok((start.elapsed(), dst.to_vec(input.len())?))
    });
    match decoded {
        Ok((elapsed, output)) => {
            report.decompress_time = elapsed;
            report.verified = output == input;
            if !report.verified {
                warn!(option = ?settings.option, "decompressed bytes differ from the original");
            }
            report.output = Arc::from(output);
        }
        Err(error) => {
            warn!(option = ?settings.option, %error, "workbench decompression failed");
            report.failure = Some(error.to_string());
        }
    }
    report
}
