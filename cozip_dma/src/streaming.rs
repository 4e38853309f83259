use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::debug;

use crate::dma::{DmaDevice, DmaQueue, QueueDesc};
use crate::memory::AlignedBuffer;
use crate::source::CompressedSource;
use crate::stream_state::{ChunkDispatch, FileReadState};
use crate::stream_worker::{IoPool, StreamWorker, WorkerSignal};
use crate::{
    CozipDmaError, MAX_CONCURRENT_REQUESTS, MAX_QUEUE_DEPTH_PER_FILE, READ_BLOCK_SIZE,
    UNBUFFERED_READ_ALIGNMENT, lock,
};

const WORKER_WAIT_MS: u64 = 1;
/// Largest offset a positioned read accepts (`off_t` is signed).
const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaKickoffBehavior {
    /// Chunks are submitted as soon as their bytes have arrived.
    Immediate,
    /// Ready chunks wait for [`StreamingDma::explicit_tick`].
    ExplicitTick,
}

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub kickoff: DmaKickoffBehavior,
    pub read_block_size: usize,
    pub unbuffered_alignment: usize,
    pub max_concurrent_requests: usize,
    pub max_queue_depth_per_file: usize,
    pub poll_interval: Duration,
    pub worker_name: String,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            kickoff: DmaKickoffBehavior::Immediate,
            read_block_size: READ_BLOCK_SIZE,
            unbuffered_alignment: UNBUFFERED_READ_ALIGNMENT,
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            max_queue_depth_per_file: MAX_QUEUE_DEPTH_PER_FILE,
            poll_interval: Duration::from_millis(WORKER_WAIT_MS),
            worker_name: "cozip-dma-stream".to_string(),
        }
    }
}

impl StreamingOptions {
    pub fn validate(&self) -> Result<(), CozipDmaError> {
        if !self.unbuffered_alignment.is_power_of_two() || self.unbuffered_alignment < 4 {
            return Err(CozipDmaError::InvalidOptions(
                "unbuffered_alignment must be a power of two of at least 4",
            ));
        }

        if self.read_block_size == 0 || self.read_block_size % self.unbuffered_alignment != 0 {
            return Err(CozipDmaError::InvalidOptions(
                "read_block_size must be a non-zero multiple of unbuffered_alignment",
            ));
        }

        if self.max_concurrent_requests == 0 {
            return Err(CozipDmaError::InvalidOptions(
                "max_concurrent_requests must be greater than 0",
            ));
        }

        if self.max_queue_depth_per_file == 0
            || self.max_queue_depth_per_file > self.max_concurrent_requests
        {
            return Err(CozipDmaError::InvalidOptions(
                "max_queue_depth_per_file must be between 1 and max_concurrent_requests",
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(CozipDmaError::InvalidOptions(
                "poll_interval must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Supplies the decompressed output buffer once its size is known. Returning
/// `None` fails the read with an allocation error.
pub type OutputAllocator = Box<dyn FnOnce(usize) -> Option<AlignedBuffer> + Send>;

/// Runs on the worker thread before the read's result becomes observable.
pub type CompletionRoutine =
    Box<dyn FnOnce(&Result<DecompressedOutput, CozipDmaError>) + Send>;

#[derive(Default)]
pub struct ReadOptions {
    pub allocator: Option<OutputAllocator>,
    pub completion: Option<CompletionRoutine>,
}

impl ReadOptions {
    pub fn with_allocator(
        mut self,
        allocator: impl FnOnce(usize) -> Option<AlignedBuffer> + Send + 'static,
    ) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    pub fn with_completion(
        mut self,
        completion: impl FnOnce(&Result<DecompressedOutput, CozipDmaError>) + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("allocator", &self.allocator.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub bytes_read: u64,
    pub block_count: usize,
    pub chunk_count: usize,
    pub aligned_reads: bool,
    pub peak_requests_in_flight: usize,
    pub dispatches: Vec<ChunkDispatch>,
}

#[derive(Debug)]
pub struct DecompressedOutput {
    /// Output allocation; may extend past `len`. The tail is zeroed.
    pub buffer: AlignedBuffer,
    pub len: usize,
    pub stats: ReadStats,
}

impl DecompressedOutput {
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub files_submitted: u64,
    pub files_completed: u64,
    pub files_in_flight: u64,
}

enum SlotState {
    Pending,
    Complete(Result<DecompressedOutput, CozipDmaError>),
    Taken,
}

pub(crate) struct ReadSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ReadSlot {
    pub(crate) fn complete(&self, outcome: Result<DecompressedOutput, CozipDmaError>) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, SlotState::Pending) {
                *state = SlotState::Complete(outcome);
            }
            self.ready.notify_all();
        }
    }
}

/// Handle to an asynchronous compressed read.
#[derive(Clone)]
pub struct PendingRead {
    slot: Arc<ReadSlot>,
}

impl PendingRead {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(ReadSlot {
                state: Mutex::new(SlotState::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    pub(crate) fn slot(&self) -> Arc<ReadSlot> {
        Arc::clone(&self.slot)
    }

    pub fn is_complete(&self) -> bool {
        self.slot
            .state
            .lock()
            .map(|state| !matches!(*state, SlotState::Pending))
            .unwrap_or(true)
    }

    pub fn wait(self) -> Result<DecompressedOutput, CozipDmaError> {
        let mut state = lock(&self.slot.state)?;
        while matches!(*state, SlotState::Pending) {
            state = self
                .slot
                .ready
                .wait(state)
                .map_err(|_| CozipDmaError::Internal("mutex poisoned"))?;
        }
        take_outcome(&mut state)
    }

    /// Takes the result if it arrives within `timeout`.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Result<DecompressedOutput, CozipDmaError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock().ok()?;
        while matches!(*state, SlotState::Pending) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.slot.ready.wait_timeout(state, deadline - now).ok()?.0;
        }
        Some(take_outcome(&mut state))
    }

    pub fn try_take(&self) -> Option<Result<DecompressedOutput, CozipDmaError>> {
        self.wait_timeout(Duration::ZERO)
    }
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("complete", &self.is_complete())
            .finish()
    }
}

fn take_outcome(state: &mut SlotState) -> Result<DecompressedOutput, CozipDmaError> {
    match std::mem::replace(state, SlotState::Taken) {
        SlotState::Complete(outcome) => outcome,
        SlotState::Taken => Err(CozipDmaError::Internal("read result already taken")),
        SlotState::Pending => Err(CozipDmaError::Internal("read still pending")),
    }
}

pub(crate) struct ContextShared {
    pub new_requests: SegQueue<FileReadState>,
    pub exit_requested: AtomicBool,
    pub files_submitted: AtomicU64,
    pub files_completed: AtomicU64,
    finished: Mutex<bool>,
    finished_signal: Condvar,
}

impl ContextShared {
    fn new() -> Self {
        Self {
            new_requests: SegQueue::new(),
            exit_requested: AtomicBool::new(false),
            files_submitted: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            finished: Mutex::new(false),
            finished_signal: Condvar::new(),
        }
    }

    /// Queues `file` for the worker, or refuses it once the worker has
    /// stopped admitting files.
    pub(crate) fn enqueue(&self, mut file: FileReadState) -> Result<(), CozipDmaError> {
        let finished = lock(&self.finished)?;
        if *finished || self.exit_requested.load(Ordering::Acquire) {
            file.disarm();
            return Err(CozipDmaError::ShutDown);
        }
        self.new_requests.push(file);
        self.files_submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Marks the worker finished when exit was requested and nothing is
    /// waiting for admission. Runs under the same lock as `enqueue`.
    pub(crate) fn try_finish(&self) -> bool {
        let Ok(mut finished) = self.finished.lock() else {
            return true;
        };
        if !self.exit_requested.load(Ordering::Acquire) || !self.new_requests.is_empty() {
            return false;
        }
        *finished = true;
        self.finished_signal.notify_all();
        true
    }

    pub(crate) fn mark_finished(&self) {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = true;
            self.finished_signal.notify_all();
        }
    }

    fn wait_finished(&self, timeout: Duration) -> Result<bool, CozipDmaError> {
        let guard = lock(&self.finished)?;
        let (guard, _) = self
            .finished_signal
            .wait_timeout_while(guard, timeout, |finished| !*finished)
            .map_err(|_| CozipDmaError::Internal("mutex poisoned"))?;
        Ok(*guard)
    }
}

/// Background reader that streams chunked compressed files through the
/// transfer engine.
///
/// One worker thread owns every in-flight file. Callers hand requests over a
/// lock-free queue and learn about completion through [`PendingRead`] or a
/// completion routine.
pub struct StreamingDma {
    shared: Arc<ContextShared>,
    signals: Sender<WorkerSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    options: StreamingOptions,
    next_file_id: AtomicU64,
}

impl StreamingDma {
    /// Starts the worker. Without an explicit queue a dedicated one is
    /// created on `device`.
    pub fn init(
        device: &DmaDevice,
        queue: Option<Arc<DmaQueue>>,
        options: StreamingOptions,
    ) -> Result<Self, CozipDmaError> {
        options.validate()?;
        let queue = match queue {
            Some(queue) => queue,
            None => device.create_queue(QueueDesc::default())?,
        };

        let shared = Arc::new(ContextShared::new());
        let (signals, receiver) = mpsc::channel();
        let io = IoPool::spawn(
            options.max_concurrent_requests,
            &options.worker_name,
            signals.clone(),
        )?;
        let worker = StreamWorker::new(
            Arc::clone(&shared),
            receiver,
            device.clone(),
            queue,
            options.clone(),
            io,
        );
        let handle = std::thread::Builder::new()
            .name(options.worker_name.clone())
            .spawn(move || worker.run())?;
        debug!(
            kickoff = ?options.kickoff,
            worker = %options.worker_name,
            "streaming context started"
        );

        Ok(Self {
            shared,
            signals,
            worker: Mutex::new(Some(handle)),
            options,
            next_file_id: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &StreamingOptions {
        &self.options
    }

    /// Starts reading `len` bytes of a chunked stream at `offset` of `source`.
    ///
    /// Parameter errors are returned here and leave the worker untouched;
    /// everything after that is reported through the returned handle.
    pub fn read_file_compressed(
        &self,
        source: Arc<dyn CompressedSource>,
        offset: u64,
        len: usize,
        options: ReadOptions,
    ) -> Result<PendingRead, CozipDmaError> {
        if len == 0 {
            return Err(CozipDmaError::InvalidArgument("read length must be non-zero"));
        }
        if offset % 4 != 0 {
            return Err(CozipDmaError::InvalidArgument(
                "read offset must be 4-byte aligned",
            ));
        }
        if u32::try_from(len).is_err() {
            return Err(CozipDmaError::DataTooLarge);
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= MAX_FILE_OFFSET => {}
            _ => {
                return Err(CozipDmaError::InvalidArgument(
                    "read range exceeds the largest file offset",
                ));
            }
        }
        if self.shared.exit_requested.load(Ordering::Acquire) {
            return Err(CozipDmaError::ShutDown);
        }

        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingRead::new();
        let file = FileReadState::new(
            id,
            source,
            offset,
            len,
            &self.options,
            options,
            pending.slot(),
        )?;

        self.shared.enqueue(file)?;
        self.signals
            .send(WorkerSignal::NewRequest)
            .map_err(|_| CozipDmaError::ShutDown)?;
        debug!(file = id, offset, len, "compressed read queued");
        Ok(pending)
    }

    /// Submits every chunk that has become ready since the last tick.
    pub fn explicit_tick(&self) -> Result<(), CozipDmaError> {
        if self.options.kickoff != DmaKickoffBehavior::ExplicitTick {
            return Err(CozipDmaError::InvalidArgument(
                "explicit tick requires ExplicitTick kickoff",
            ));
        }
        self.signals
            .send(WorkerSignal::DispatchTick)
            .map_err(|_| CozipDmaError::ShutDown)
    }

    /// Lets in-flight files drain and stops the worker. Returns `false` if
    /// the worker is still draining when `timeout` expires.
    pub fn shutdown(&self, timeout: Duration) -> Result<bool, CozipDmaError> {
        self.shared.exit_requested.store(true, Ordering::Release);
        let _ = self.signals.send(WorkerSignal::Wake);

        if !self.shared.wait_finished(timeout)? {
            return Ok(false);
        }
        if let Some(handle) = lock(&self.worker)?.take() {
            handle
                .join()
                .map_err(|_| CozipDmaError::Internal("streaming worker panicked"))?;
            debug!("streaming context shut down");
        }
        Ok(true)
    }

    pub fn stats(&self) -> ContextStats {
        let files_submitted = self.shared.files_submitted.load(Ordering::Acquire);
        let files_completed = self.shared.files_completed.load(Ordering::Acquire);
        ContextStats {
            files_submitted,
            files_completed,
            files_in_flight: files_submitted.saturating_sub(files_completed),
        }
    }
}

impl Drop for StreamingDma {
    fn drop(&mut self) {
        // The worker drains on its own; it is not joined here.
        self.shared.exit_requested.store(true, Ordering::Release);
        let _ = self.signals.send(WorkerSignal::Wake);
    }
}

impl fmt::Debug for StreamingDma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingDma")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

static STREAMING_CONTEXT: OnceLock<Mutex<Option<Arc<StreamingDma>>>> = OnceLock::new();

fn context_slot() -> &'static Mutex<Option<Arc<StreamingDma>>> {
    STREAMING_CONTEXT.get_or_init(|| Mutex::new(None))
}

fn current_context() -> Result<Arc<StreamingDma>, CozipDmaError> {
    lock(context_slot())?
        .clone()
        .ok_or(CozipDmaError::NotInitialized)
}

/// Installs the process-wide context. Fails if one is already running.
pub fn init_streaming_dma(
    device: &DmaDevice,
    queue: Option<Arc<DmaQueue>>,
    options: StreamingOptions,
) -> Result<(), CozipDmaError> {
    let mut slot = lock(context_slot())?;
    if slot.is_some() {
        return Err(CozipDmaError::AlreadyInitialized);
    }
    *slot = Some(Arc::new(StreamingDma::init(device, queue, options)?));
    Ok(())
}

pub fn read_file_compressed(
    source: Arc<dyn CompressedSource>,
    offset: u64,
    len: usize,
    options: ReadOptions,
) -> Result<PendingRead, CozipDmaError> {
    current_context()?.read_file_compressed(source, offset, len, options)
}

pub fn streaming_dma_explicit_tick() -> Result<(), CozipDmaError> {
    current_context()?.explicit_tick()
}

/// Drains and removes the process-wide context. Succeeds trivially when none
/// is installed.
pub fn shutdown_streaming_dma(timeout: Duration) -> Result<bool, CozipDmaError> {
    let Some(context) = lock(context_slot())?.clone() else {
        return Ok(true);
    };
    let finished = context.shutdown(timeout)?;
    if finished {
        let mut slot = lock(context_slot())?;
        if slot
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, &context))
        {
            slot.take();
        }
    }
    Ok(finished)
}
