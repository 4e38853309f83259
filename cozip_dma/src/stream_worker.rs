use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::dma::{DmaDevice, DmaQueue};
use crate::memory::AlignedBuffer;
use crate::source::CompressedSource;
use crate::stream_state::{DispatchBatch, FileId, FileReadState, ReadPlan};
use crate::streaming::{ContextShared, DmaKickoffBehavior, StreamingOptions};
use crate::CozipDmaError;

pub(crate) enum WorkerSignal {
    NewRequest,
    DispatchTick,
    Wake,
    ReadComplete(ReadCompletion),
}

pub(crate) struct ReadJob {
    slot: usize,
    file: FileId,
    plan: ReadPlan,
    source: Arc<dyn CompressedSource>,
    buffer: AlignedBuffer,
}

pub(crate) struct ReadCompletion {
    slot: usize,
    file: FileId,
    plan: ReadPlan,
    buffer: AlignedBuffer,
    result: io::Result<usize>,
}

/// Threads that perform the positioned reads, one per request slot.
pub(crate) struct IoPool {
    jobs: Option<Sender<ReadJob>>,
    threads: Vec<JoinHandle<()>>,
}

impl IoPool {
    pub fn spawn(
        threads: usize,
        name: &str,
        signals: Sender<WorkerSignal>,
    ) -> Result<Self, CozipDmaError> {
        let (jobs, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut pool = Self {
            jobs: Some(jobs),
            threads: Vec::with_capacity(threads),
        };
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let signals = signals.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-io-{index}"))
                .spawn(move || run_io_thread(receiver, signals))?;
            pool.threads.push(handle);
        }
        Ok(pool)
    }

    fn submit(&self, job: ReadJob) -> Result<(), CozipDmaError> {
        self.jobs
            .as_ref()
            .ok_or(CozipDmaError::ShutDown)?
            .send(job)
            .map_err(|_| CozipDmaError::Internal("i/o threads exited"))
    }

    fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_io_thread(jobs: Arc<Mutex<Receiver<ReadJob>>>, signals: Sender<WorkerSignal>) {
    loop {
        let job = {
            let Ok(receiver) = jobs.lock() else {
                return;
            };
            match receiver.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };

        let ReadJob {
            slot,
            file,
            plan,
            source,
            mut buffer,
        } = job;
        let result = match buffer.get_mut(..plan.len) {
            Some(target) => source.read_at(plan.file_offset, target),
            None => Err(io::Error::other("read plan exceeds block buffer")),
        };

        let completion = ReadCompletion {
            slot,
            file,
            plan,
            buffer,
            result,
        };
        if signals.send(WorkerSignal::ReadComplete(completion)).is_err() {
            return;
        }
    }
}

/// Owns every admitted file and the request slots.
pub(crate) struct StreamWorker {
    shared: Arc<ContextShared>,
    signals: Receiver<WorkerSignal>,
    device: DmaDevice,
    queue: Arc<DmaQueue>,
    options: StreamingOptions,
    io: IoPool,
    slot_owner: Vec<Option<FileId>>,
    idle_slots: Vec<usize>,
    files: Vec<FileReadState>,
    cursor: usize,
}

impl StreamWorker {
    pub fn new(
        shared: Arc<ContextShared>,
        signals: Receiver<WorkerSignal>,
        device: DmaDevice,
        queue: Arc<DmaQueue>,
        options: StreamingOptions,
        io: IoPool,
    ) -> Self {
        let slots = options.max_concurrent_requests;
        Self {
            shared,
            signals,
            device,
            queue,
            options,
            io,
            slot_owner: vec![None; slots],
            idle_slots: (0..slots).rev().collect(),
            files: Vec::new(),
            cursor: 0,
        }
    }

    pub fn run(mut self) {
        debug!("streaming worker started");
        loop {
            match self.signals.recv_timeout(self.options.poll_interval) {
                Ok(WorkerSignal::ReadComplete(completion)) => self.on_read_complete(completion),
                Ok(WorkerSignal::DispatchTick) => self.kickoff_all(),
                Ok(WorkerSignal::NewRequest) | Ok(WorkerSignal::Wake) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.admit_new_files();
            self.retire_finished_files();

            if self.files.is_empty() && self.shared.try_finish() {
                break;
            }
        }

        self.io.shutdown();
        self.shared.mark_finished();
        // Only reachable after a disconnect; dropping a file fails its read.
        while let Some(file) = self.shared.new_requests.pop() {
            trace!(file = file.id, "file dropped at worker exit");
        }
        debug!("streaming worker exited");
    }

    fn admit_new_files(&mut self) {
        while let Some(file) = self.shared.new_requests.pop() {
            trace!(file = file.id, "file admitted");
            self.files.push(file);
            let index = self.files.len() - 1;
            while let Some(slot) = self.idle_slots.pop() {
                if !self.issue_next_block(index, slot) {
                    self.idle_slots.push(slot);
                    break;
                }
            }
        }
    }

    /// Puts the file's next unissued block on `slot`. False when the file
    /// cannot take another request.
    fn issue_next_block(&mut self, index: usize, slot: usize) -> bool {
        let depth = self.options.max_queue_depth_per_file;
        let file = &mut self.files[index];
        if file.requests_in_flight() >= depth {
            return false;
        }
        let Some(block) = file.next_unissued_block() else {
            return false;
        };

        let plan = match file.plan_read(block) {
            Ok(plan) => plan,
            Err(error) => {
                file.fail(error);
                return false;
            }
        };
        let buffer = match file.take_block_buffer(block) {
            Ok(buffer) => buffer,
            Err(error) => {
                file.fail(error);
                return false;
            }
        };
        file.mark_issued(block);
        self.slot_owner[slot] = Some(file.id);

        let job = ReadJob {
            slot,
            file: file.id,
            plan,
            source: file.source(),
            buffer,
        };
        if let Err(error) = self.io.submit(job) {
            file.finish_request();
            file.fail(error);
            self.slot_owner[slot] = None;
            return false;
        }
        trace!(file = file.id, block, slot, "read issued");
        true
    }

    fn on_read_complete(&mut self, completion: ReadCompletion) {
        let ReadCompletion {
            slot,
            file: file_id,
            plan,
            buffer,
            result,
        } = completion;
        debug_assert_eq!(self.slot_owner[slot], Some(file_id));

        let Some(index) = self.files.iter().position(|file| file.id == file_id) else {
            self.slot_owner[slot] = None;
            self.offer_slot(slot, None);
            return;
        };

        let file = &mut self.files[index];
        match result {
            Ok(bytes_read) => {
                file.finish_request();
                if let Err(error) = file.complete_read(&plan, buffer, bytes_read) {
                    file.fail(error);
                }
            }
            Err(error) if file.should_retry_aligned(&plan, &error) => {
                file.enable_aligned_reads();
                match file.plan_read(plan.block) {
                    Ok(retry) => {
                        trace!(
                            file = file_id,
                            block = plan.block,
                            offset = retry.file_offset,
                            len = retry.len,
                            "reissuing read at aligned offset"
                        );
                        let job = ReadJob {
                            slot,
                            file: file_id,
                            plan: retry,
                            source: file.source(),
                            buffer,
                        };
                        match self.io.submit(job) {
                            Ok(()) => return,
                            Err(error) => {
                                file.finish_request();
                                file.fail(error);
                            }
                        }
                    }
                    Err(error) => {
                        file.finish_request();
                        file.fail(error);
                    }
                }
            }
            Err(error) => {
                file.finish_request();
                file.fail(CozipDmaError::Io(error));
            }
        }

        self.reassign_slot(slot, index);

        let file = &self.files[index];
        if self.options.kickoff == DmaKickoffBehavior::Immediate
            && file.header_parsed()
            && !file.has_error()
        {
            self.kickoff(index);
        }
    }

    /// Same file first, then the other files round-robin.
    fn reassign_slot(&mut self, slot: usize, index: usize) {
        self.slot_owner[slot] = None;
        if self.issue_next_block(index, slot) {
            return;
        }
        self.offer_slot(slot, Some(index));
    }

    fn offer_slot(&mut self, slot: usize, skip: Option<usize>) {
        let count = self.files.len();
        for step in 0..count {
            let candidate = (self.cursor + step) % count;
            if Some(candidate) != skip && self.issue_next_block(candidate, slot) {
                self.cursor = (candidate + 1) % count;
                return;
            }
        }
        self.idle_slots.push(slot);
    }

    fn kickoff_all(&mut self) {
        for index in 0..self.files.len() {
            self.kickoff(index);
        }
    }

    fn kickoff(&mut self, index: usize) {
        let file = &mut self.files[index];
        let batch = match file.collect_dispatch() {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(error) => {
                file.fail(error);
                return;
            }
        };
        if let Err(error) = submit_batch(&self.device, &self.queue, file, batch) {
            file.fail(error);
        }
    }

    fn retire_finished_files(&mut self) {
        let mut index = 0;
        while index < self.files.len() {
            if !self.files[index].is_finished() {
                index += 1;
                continue;
            }
            let file = self.files.remove(index);
            if self.cursor > index {
                self.cursor -= 1;
            }
            file.deliver();
            self.shared.files_completed.fetch_add(1, Ordering::AcqRel);
        }
        if self.cursor >= self.files.len() {
            self.cursor = 0;
        }
    }
}

/// Records one kickoff's chunks on a fresh command list and submits it.
fn submit_batch(
    device: &DmaDevice,
    queue: &DmaQueue,
    file: &mut FileReadState,
    batch: DispatchBatch,
) -> Result<(), CozipDmaError> {
    let output = file.output()?.clone();
    let tracking = Arc::clone(file.tracking()?);
    let sentinel = file.sentinel_slot();

    let mut list = device.create_command_list();
    for work in batch.work {
        if let Some(fill) = work.tail_fill {
            list.fill_memory_u32(output.clone(), fill, 0)?;
            list.copy_last_error_code(Arc::clone(&tracking), sentinel)?;
        }
        list.lz_decompress(output.clone(), work.dst_range, work.src)?;
        list.copy_last_error_code(Arc::clone(&tracking), work.chunk)?;
    }

    if !list.is_empty() {
        list.close();
        queue.execute(&mut list)?;
    }
    if batch.signal_fence {
        let fence = device.create_fence(0);
        queue.signal(&fence, 1)?;
        file.set_fence(fence);
        trace!(file = file.id, "all chunks queued, completion fence signaled");
    }
    Ok(())
}
