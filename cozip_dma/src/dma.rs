//! Emulated transfer engine.
//!
//! A queue owns one engine thread that executes closed command lists strictly
//! in submission order. Fence signals travel through the same channel, so a
//! retired fence value implies every earlier list has finished.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::codec::{FragmentCodec, ZlibCodec};
use crate::memory::{AlignedBuffer, DmaBuffer};
use crate::{CozipDmaError, FRAGMENT_PREFIX_LEN, lock};

pub const DMA_STATUS_OK: u32 = 0;
pub const DMA_STATUS_CORRUPT_STREAM: u32 = 0x8000_0001;
pub const DMA_STATUS_SIZE_MISMATCH: u32 = 0x8000_0002;
pub const DMA_STATUS_OUTPUT_OVERFLOW: u32 = 0x8000_0003;
pub const DMA_STATUS_OUT_OF_RANGE: u32 = 0x8000_0004;

const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the codec the engine's LZ unit runs.
#[derive(Debug, Clone)]
pub struct DmaDevice {
    codec: Arc<dyn FragmentCodec>,
}

impl Default for DmaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaDevice {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(ZlibCodec::new(6)))
    }

    pub fn with_codec(codec: Arc<dyn FragmentCodec>) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &Arc<dyn FragmentCodec> {
        &self.codec
    }

    pub fn create_queue(&self, desc: QueueDesc) -> Result<Arc<DmaQueue>, CozipDmaError> {
        DmaQueue::spawn(desc, Arc::clone(&self.codec)).map(Arc::new)
    }

    pub fn create_fence(&self, initial_value: u64) -> Arc<Fence> {
        Arc::new(Fence::new(initial_value))
    }

    pub fn create_command_list(&self) -> DmaCommandList {
        DmaCommandList::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDesc {
    pub engine_index: u32,
}

impl Default for QueueDesc {
    fn default() -> Self {
        Self { engine_index: 2 }
    }
}

/// Monotonic completion counter.
#[derive(Debug)]
pub struct Fence {
    completed: Mutex<u64>,
    retired: Condvar,
}

impl Fence {
    pub fn new(initial_value: u64) -> Self {
        Self {
            completed: Mutex::new(initial_value),
            retired: Condvar::new(),
        }
    }

    pub fn completed_value(&self) -> u64 {
        self.completed.lock().map(|value| *value).unwrap_or(0)
    }

    pub fn signal(&self, value: u64) {
        if let Ok(mut completed) = self.completed.lock() {
            if value > *completed {
                *completed = value;
            }
            self.retired.notify_all();
        }
    }

    /// Blocks until the fence reaches `value`; false on timeout.
    pub fn wait_for(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut completed) = self.completed.lock() else {
            return false;
        };
        while *completed < value {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.retired.wait_timeout(completed, deadline - now) {
                Ok((guard, _)) => completed = guard,
                Err(_) => return false,
            }
        }
        true
    }
}

/// Page of 32-bit status slots written by `CopyLastErrorCode`.
#[derive(Debug)]
pub struct ErrorCodePage {
    codes: Vec<AtomicU32>,
}

impl ErrorCodePage {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            codes: (0..slots).map(|_| AtomicU32::new(DMA_STATUS_OK)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn load(&self, index: usize) -> Option<u32> {
        self.codes.get(index).map(|code| code.load(Ordering::Acquire))
    }

    pub fn store(&self, index: usize, code: u32) -> bool {
        match self.codes.get(index) {
            Some(slot) => {
                slot.store(code, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// First nonzero slot below `limit`.
    pub fn first_error(&self, limit: usize) -> Option<(usize, u32)> {
        self.codes
            .iter()
            .take(limit)
            .map(|code| code.load(Ordering::Acquire))
            .enumerate()
            .find(|(_, code)| *code != DMA_STATUS_OK)
    }
}

/// Read-only source operand of an engine command.
#[derive(Clone)]
pub enum SourceBytes {
    Owned(Arc<[u8]>),
    Buffer {
        buffer: DmaBuffer,
        range: Range<usize>,
    },
    /// Pieces of consecutive read blocks, concatenated in order.
    Spans(Vec<(Arc<AlignedBuffer>, Range<usize>)>),
}

impl SourceBytes {
    pub fn owned(bytes: &[u8]) -> Self {
        Self::Owned(Arc::from(bytes))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Owned(bytes) => bytes.len(),
            Self::Buffer { range, .. } => range.len(),
            Self::Spans(spans) => spans.iter().map(|(_, range)| range.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_bytes<R>(
        &self,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, CozipDmaError> {
        match self {
            Self::Owned(bytes) => Ok(f(bytes)),
            Self::Buffer { buffer, range } => {
                let guard = buffer.lock()?;
                let bytes = guard
                    .get(range.clone())
                    .ok_or(CozipDmaError::InvalidArgument("source range out of bounds"))?;
                Ok(f(bytes))
            }
            Self::Spans(spans) => {
                let mut pieces = Vec::with_capacity(spans.len());
                for (block, range) in spans {
                    pieces.push(
                        block
                            .get(range.clone())
                            .ok_or(CozipDmaError::InvalidArgument("source span out of bounds"))?,
                    );
                }
                let joined: Cow<'_, [u8]> = match pieces.as_slice() {
                    [single] => Cow::Borrowed(*single),
                    _ => Cow::Owned(pieces.concat()),
                };
                Ok(f(&joined))
            }
        }
    }
}

impl fmt::Debug for SourceBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(bytes) => f.debug_tuple("Owned").field(&bytes.len()).finish(),
            Self::Buffer { range, .. } => f.debug_struct("Buffer").field("range", range).finish(),
            Self::Spans(spans) => f.debug_tuple("Spans").field(&spans.len()).finish(),
        }
    }
}

#[derive(Debug)]
enum DmaCommand {
    LzCompress {
        dst: DmaBuffer,
        src: SourceBytes,
    },
    LzDecompress {
        dst: DmaBuffer,
        dst_range: Range<usize>,
        src: SourceBytes,
    },
    FillMemory {
        dst: DmaBuffer,
        range: Range<usize>,
        value: u32,
    },
    CopyLastErrorCode {
        page: Arc<ErrorCodePage>,
        slot: usize,
    },
}

#[derive(Debug, Default)]
pub struct DmaCommandList {
    commands: Vec<DmaCommand>,
    closed: bool,
}

impl DmaCommandList {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Compresses `src` into `dst` as a size-prefixed stream.
    pub fn lz_compress(&mut self, dst: DmaBuffer, src: SourceBytes) -> Result<(), CozipDmaError> {
        self.record(DmaCommand::LzCompress { dst, src })
    }

    /// Decodes `src`, which must produce exactly `dst_range.len()` bytes.
    pub fn lz_decompress(
        &mut self,
        dst: DmaBuffer,
        dst_range: Range<usize>,
        src: SourceBytes,
    ) -> Result<(), CozipDmaError> {
        self.record(DmaCommand::LzDecompress {
            dst,
            dst_range,
            src,
        })
    }

    pub fn fill_memory_u32(
        &mut self,
        dst: DmaBuffer,
        range: Range<usize>,
        value: u32,
    ) -> Result<(), CozipDmaError> {
        self.record(DmaCommand::FillMemory { dst, range, value })
    }

    pub fn copy_last_error_code(
        &mut self,
        page: Arc<ErrorCodePage>,
        slot: usize,
    ) -> Result<(), CozipDmaError> {
        self.record(DmaCommand::CopyLastErrorCode { page, slot })
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn reset(&mut self) {
        self.commands.clear();
        self.closed = false;
    }

    fn record(&mut self, command: DmaCommand) -> Result<(), CozipDmaError> {
        if self.closed {
            return Err(CozipDmaError::Engine(
                "cannot record into a closed command list".to_string(),
            ));
        }
        self.commands.push(command);
        Ok(())
    }
}

enum QueueMessage {
    Execute(Vec<DmaCommand>),
    Signal(Arc<Fence>, u64),
}

pub struct DmaQueue {
    desc: QueueDesc,
    sender: Mutex<Option<Sender<QueueMessage>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DmaQueue {
    fn spawn(desc: QueueDesc, codec: Arc<dyn FragmentCodec>) -> Result<Self, CozipDmaError> {
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("cozip-dma-engine-{}", desc.engine_index))
            .spawn(move || run_engine(receiver, codec))?;
        debug!(engine = desc.engine_index, "transfer queue created");

        Ok(Self {
            desc,
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn desc(&self) -> QueueDesc {
        self.desc
    }

    /// Submits a closed list. The list is left empty and closed; reset it
    /// before recording again.
    pub fn execute(&self, list: &mut DmaCommandList) -> Result<(), CozipDmaError> {
        if !list.closed {
            return Err(CozipDmaError::Engine(
                "command list must be closed before execution".to_string(),
            ));
        }
        let commands = std::mem::take(&mut list.commands);
        self.send(QueueMessage::Execute(commands))
    }

    /// Queues a fence signal behind all previously submitted work.
    pub fn signal(&self, fence: &Arc<Fence>, value: u64) -> Result<(), CozipDmaError> {
        self.send(QueueMessage::Signal(Arc::clone(fence), value))
    }

    fn send(&self, message: QueueMessage) -> Result<(), CozipDmaError> {
        let guard = lock(&self.sender)?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| CozipDmaError::Engine("transfer queue is closed".to_string()))?;
        sender
            .send(message)
            .map_err(|_| CozipDmaError::Engine("transfer engine thread exited".to_string()))
    }
}

impl fmt::Debug for DmaQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaQueue").field("desc", &self.desc).finish()
    }
}

impl Drop for DmaQueue {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut thread) = self.thread.lock()
            && let Some(handle) = thread.take()
        {
            let _ = handle.join();
        }
    }
}

fn run_engine(receiver: Receiver<QueueMessage>, codec: Arc<dyn FragmentCodec>) {
    let mut last_error = DMA_STATUS_OK;
    while let Ok(message) = receiver.recv() {
        match message {
            QueueMessage::Execute(commands) => {
                for command in commands {
                    execute_command(command, codec.as_ref(), &mut last_error);
                }
            }
            QueueMessage::Signal(fence, value) => {
                trace!(value, "fence signaled");
                fence.signal(value);
            }
        }
    }
}

fn execute_command(command: DmaCommand, codec: &dyn FragmentCodec, last_error: &mut u32) {
    match command {
        DmaCommand::LzCompress { dst, src } => {
            *last_error = run_compress(&dst, &src, codec);
        }
        DmaCommand::LzDecompress {
            dst,
            dst_range,
            src,
        } => {
            *last_error = run_decompress(&dst, dst_range, &src, codec);
        }
        DmaCommand::FillMemory { dst, range, value } => {
            *last_error = run_fill(&dst, range, value);
        }
        DmaCommand::CopyLastErrorCode { page, slot } => {
            if !page.store(slot, *last_error) {
                warn!(slot, "error code slot out of range");
            }
        }
    }
}

fn run_compress(dst: &DmaBuffer, src: &SourceBytes, codec: &dyn FragmentCodec) -> u32 {
    let stream = match src.with_bytes(|bytes| codec.compress(bytes)) {
        Ok(Ok(stream)) => stream,
        _ => return DMA_STATUS_CORRUPT_STREAM,
    };
    let Ok(mut guard) = dst.lock() else {
        return DMA_STATUS_OUT_OF_RANGE;
    };
    let end = FRAGMENT_PREFIX_LEN + stream.len();
    let Ok(size) = u32::try_from(stream.len()) else {
        return DMA_STATUS_OUTPUT_OVERFLOW;
    };
    if end > guard.len() {
        return DMA_STATUS_OUTPUT_OVERFLOW;
    }
    guard[..FRAGMENT_PREFIX_LEN].copy_from_slice(&size.to_le_bytes());
    guard[FRAGMENT_PREFIX_LEN..end].copy_from_slice(&stream);
    DMA_STATUS_OK
}

fn run_decompress(
    dst: &DmaBuffer,
    dst_range: Range<usize>,
    src: &SourceBytes,
    codec: &dyn FragmentCodec,
) -> u32 {
    if let SourceBytes::Buffer { buffer, .. } = src
        && buffer.same_buffer(dst)
    {
        return DMA_STATUS_OUT_OF_RANGE;
    }
    let Ok(mut guard) = dst.lock() else {
        return DMA_STATUS_OUT_OF_RANGE;
    };
    let expected = dst_range.len();
    let Some(target) = guard.get_mut(dst_range) else {
        return DMA_STATUS_OUT_OF_RANGE;
    };
    match src.with_bytes(|bytes| codec.decompress(bytes, target)) {
        Ok(Ok(written)) if written == expected => DMA_STATUS_OK,
        Ok(Ok(_)) => DMA_STATUS_SIZE_MISMATCH,
        Ok(Err(_)) => DMA_STATUS_CORRUPT_STREAM,
        Err(_) => DMA_STATUS_OUT_OF_RANGE,
    }
}

fn run_fill(dst: &DmaBuffer, range: Range<usize>, value: u32) -> u32 {
    let Ok(mut guard) = dst.lock() else {
        return DMA_STATUS_OUT_OF_RANGE;
    };
    let Some(target) = guard.get_mut(range) else {
        return DMA_STATUS_OUT_OF_RANGE;
    };
    let pattern = value.to_le_bytes();
    for (index, byte) in target.iter_mut().enumerate() {
        *byte = pattern[index % 4];
    }
    DMA_STATUS_OK
}

/// Signal-and-wait helper for one queue, with its own fence.
#[derive(Debug)]
pub struct FrameSync {
    fence: Arc<Fence>,
    value: u64,
    timeout: Duration,
}

impl FrameSync {
    pub fn new(device: &DmaDevice) -> Self {
        Self {
            fence: device.create_fence(0),
            value: 0,
            timeout: FRAME_WAIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Signals the next fence value on `queue`, blocks until it retires and
    /// resets `list` for reuse.
    pub fn wait_for_frame(
        &mut self,
        queue: &DmaQueue,
        list: Option<&mut DmaCommandList>,
    ) -> Result<(), CozipDmaError> {
        self.value += 1;
        queue.signal(&self.fence, self.value)?;

        if self.fence.completed_value() < self.value
            && !self.fence.wait_for(self.value, self.timeout)
        {
            return Err(CozipDmaError::Engine(format!(
                "fence value {} did not retire within {:?}",
                self.value, self.timeout
            )));
        }

        if let Some(list) = list {
            list.reset();
        }
        Ok(())
    }
}
