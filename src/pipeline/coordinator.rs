// Install run coordinator
//
// Three cooperating loops drive the run: the dispatcher feeds download
// tasks to the fetcher pool, the download-result handler matches arrived
// chunks against the planner's task stream and feeds the writer, and the
// write-result handler recycles arena slots and keeps the resume journal.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

use crate::common::error::{Error, Result};
use crate::common::types::QUEUE_TIMEOUT;
use crate::common::InstallConfig;
use crate::manifest::Manifest;
use crate::pipeline::messages::{
    ChunkWrite, DownloadResult, DownloadTask, DownloaderMsg, WorkerQueues, WriterMsg, WriterResult,
};
use crate::pipeline::pool::ChunkPool;
use crate::pipeline::progress::{Counters, UiUpdate};
use crate::planner::{ChunkSource, InstallPlan, Task, TaskFlags};
use crate::storage::ResumeJournal;

/// State shared between the coordinator loops.
struct Shared {
    running: AtomicBool,
    cancelled: AtomicBool,
    /// Downloads currently in flight, guarded with `task_cond`
    active: Mutex<usize>,
    task_cond: Condvar,
    counters: Counters,
    /// Monotonic totals driving progress and shutdown
    tasks_done: AtomicUsize,
    chunks_done: AtomicUsize,
    /// Filenames whose write failed, in failure order
    write_failures: Mutex<Vec<String>>,
    /// First unrecoverable error raised by a loop
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            active: Mutex::new(0),
            task_cond: Condvar::new(),
            counters: Counters::default(),
            tasks_done: AtomicUsize::new(0),
            chunks_done: AtomicUsize::new(0),
            write_failures: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task_cond.notify_all();
    }

    fn record_fatal(&self, error: Error) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

/// Cancels a running install from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
    pool: Option<Arc<ChunkPool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.stop();
        if let Some(pool) = &self.pool {
            pool.notify_all();
        }
    }
}

/// Drives one planned install run against a set of external workers.
pub struct Coordinator {
    config: InstallConfig,
    plan: InstallPlan,
    /// Full chunk URL per queued download
    chunk_urls: HashMap<u128, String>,
    queues: WorkerQueues,
    pool: Option<Arc<ChunkPool>>,
    shared: Arc<Shared>,
    status_tx: Option<Sender<UiUpdate>>,
}

impl Coordinator {
    pub fn new(config: InstallConfig, manifest: &Manifest, plan: InstallPlan) -> Result<Self> {
        let mut chunk_urls = HashMap::with_capacity(plan.chunks_to_dl.len());
        for &guid in &plan.chunks_to_dl {
            let chunk = manifest
                .chunk_data_list
                .chunk_by_guid(guid)
                .ok_or(Error::ChunkNotFound(guid))?;
            chunk_urls.insert(
                guid,
                format!(
                    "{}/{}",
                    config.base_url,
                    chunk.path(manifest.meta.feature_level)
                ),
            );
        }

        // no arena is needed when nothing gets downloaded
        let pool = if plan.chunks_to_dl.is_empty() {
            None
        } else {
            Some(Arc::new(ChunkPool::create(
                &config.cache_dir,
                config.max_shared_memory,
                plan.analysis.biggest_chunk as u64,
            )?))
        };

        let queues = WorkerQueues::new((config.max_workers * 4).max(64));

        Ok(Self {
            config,
            plan,
            chunk_urls,
            queues,
            pool,
            shared: Arc::new(Shared::new()),
            status_tx: None,
        })
    }

    /// Attach a channel receiving periodic progress updates.
    pub fn with_status_channel(mut self, tx: Sender<UiUpdate>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Queues the caller wires its fetcher/writer workers to.
    pub fn queues(&self) -> &WorkerQueues {
        &self.queues
    }

    /// Backing file of the shared arena, if a download phase exists.
    pub fn arena_path(&self) -> Option<std::path::PathBuf> {
        self.pool.as_ref().map(|p| p.path().to_path_buf())
    }

    pub fn slot_size(&self) -> u64 {
        self.plan.analysis.biggest_chunk as u64
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
            pool: self.pool.clone(),
        }
    }

    /// Run the install to completion. Workers must already be attached to
    /// the queues; they receive one terminate sentinel each on the way out.
    pub fn run(self) -> Result<()> {
        let Coordinator {
            config,
            plan,
            chunk_urls,
            queues,
            pool,
            shared,
            status_tx,
        } = self;

        let num_tasks = plan.tasks.len();
        let num_chunk_tasks = plan.num_chunk_tasks();
        let num_dl_tasks = plan.chunks_to_dl.len();
        log::debug!(
            "Chunks to download: {}, File tasks: {}, Chunk tasks: {}",
            num_dl_tasks,
            num_tasks,
            num_chunk_tasks
        );

        let chunks_to_dl = Arc::new(Mutex::new(plan.chunks_to_dl));
        let journal = config.resume_file.as_ref().map(ResumeJournal::new);

        let mut threads: Vec<(&str, JoinHandle<()>)> = Vec::new();

        if let Some(pool) = pool.clone() {
            let dispatcher = Dispatcher {
                shared: Arc::clone(&shared),
                pool,
                chunks_to_dl: Arc::clone(&chunks_to_dl),
                chunk_urls,
                dl_tx: queues.dl_tasks.0.clone(),
                max_active: config.max_workers * 2,
            };
            threads.push(("dispatcher", thread::spawn(move || dispatcher.run())));
        }

        let dl_handler = DownloadResultHandler {
            shared: Arc::clone(&shared),
            pool: pool.clone(),
            tasks: plan.tasks,
            chunks_to_dl: Arc::clone(&chunks_to_dl),
            dl_result_rx: queues.dl_results.1.clone(),
            dl_tx: queues.dl_tasks.0.clone(),
            writer_tx: queues.writer_tasks.0.clone(),
            max_retries: config.max_retries_per_chunk,
        };
        threads.push(("download results", thread::spawn(move || dl_handler.run())));

        let fw_handler = WriteResultHandler {
            shared: Arc::clone(&shared),
            pool: pool.clone(),
            writer_result_rx: queues.writer_results.1.clone(),
            journal: journal.clone(),
            file_hashes: plan.file_hashes,
            num_tasks,
        };
        threads.push(("write results", thread::spawn(move || fw_handler.run())));

        // reporter loop: drain throughput counters and publish progress
        // until every task has been accounted for
        let start_time = Instant::now();
        let mut last_update = Instant::now();
        let mut total_dl = 0u64;
        let mut total_write = 0u64;

        while shared.running() && shared.tasks_done.load(Ordering::SeqCst) < num_tasks {
            thread::sleep(config.update_interval);
            let delta = last_update.elapsed().as_secs_f64();
            if delta <= 0.0 {
                continue;
            }
            last_update = Instant::now();

            let snap = shared.counters.drain();
            total_dl += snap.bytes_downloaded;
            total_write += snap.bytes_written;

            let dl_speed = snap.bytes_downloaded as f64 / delta;
            let dl_unc_speed = snap.bytes_decompressed as f64 / delta;
            let w_speed = snap.bytes_written as f64 / delta;
            let r_speed = snap.bytes_read as f64 / delta;

            let processed_chunks = shared.chunks_done.load(Ordering::SeqCst);
            let perc = if num_chunk_tasks > 0 {
                processed_chunks as f64 / num_chunk_tasks as f64 * 100.0
            } else {
                100.0
            };
            let memory_usage = pool
                .as_ref()
                .map(|p| (p.slot_count() - p.available()) as u64 * p.slot_size())
                .unwrap_or(0);

            log::info!(
                "= Progress: {:.02}% ({}/{}), running for {:.0}s",
                perc,
                processed_chunks,
                num_chunk_tasks,
                start_time.elapsed().as_secs_f64()
            );
            log::info!(
                " - Downloaded: {:.02} MiB, Written: {:.02} MiB",
                total_dl as f64 / 1024.0 / 1024.0,
                total_write as f64 / 1024.0 / 1024.0
            );
            log::info!(
                " + Download\t- {:.02} MiB/s (raw) / {:.02} MiB/s (decompressed)",
                dl_speed / 1024.0 / 1024.0,
                dl_unc_speed / 1024.0 / 1024.0
            );
            log::info!(
                " + Disk\t- {:.02} MiB/s (write) / {:.02} MiB/s (read)",
                w_speed / 1024.0 / 1024.0,
                r_speed / 1024.0 / 1024.0
            );

            if let Some(tx) = &status_tx {
                let update = UiUpdate {
                    progress: perc,
                    download_speed: dl_unc_speed,
                    write_speed: w_speed,
                    read_speed: r_speed,
                    memory_usage,
                };
                if tx.send_timeout(update, QUEUE_TIMEOUT).is_err() {
                    log::warn!("Failed to send status update to queue");
                }
            }
        }

        // terminate workers, one sentinel per fetcher plus one for the writer
        for _ in 0..config.max_workers {
            if queues
                .dl_tasks
                .0
                .send_timeout(DownloaderMsg::Terminate, QUEUE_TIMEOUT)
                .is_err()
            {
                log::warn!("Failed to send terminate sentinel to download worker queue");
            }
        }
        log::info!("Waiting for installation to finish...");
        if queues
            .writer_tasks
            .0
            .send_timeout(WriterMsg::Terminate, QUEUE_TIMEOUT)
            .is_err()
        {
            log::warn!("Failed to send terminate sentinel to writer queue");
        }

        // loops observe the stop flag within one queue timeout
        shared.stop();
        if let Some(pool) = &pool {
            pool.notify_all();
        }
        for (name, handle) in threads {
            if handle.join().is_err() {
                log::warn!("Thread did not terminate cleanly: {}", name);
            }
        }

        // drain whatever the workers left behind
        while queues.dl_tasks.1.try_recv().is_ok() {}
        while queues.dl_results.1.try_recv().is_ok() {}
        while queues.writer_tasks.1.try_recv().is_ok() {}
        while queues.writer_results.1.try_recv().is_ok() {}

        let cancelled = shared.cancelled.load(Ordering::SeqCst);
        let fatal = shared.fatal.lock().unwrap().take();
        let first_write_failure = shared.write_failures.lock().unwrap().first().cloned();
        let success = !cancelled && fatal.is_none() && first_write_failure.is_none();

        if success {
            if let Some(journal) = &journal {
                if journal.exists() {
                    if let Err(e) = journal.remove() {
                        log::warn!("Failed to remove resume file: {}", e);
                    }
                }
            }
        }

        if let Some(pool) = pool {
            match Arc::try_unwrap(pool) {
                Ok(pool) => {
                    if let Err(e) = pool.destroy() {
                        log::warn!("Failed to remove shared arena: {}", e);
                    }
                }
                Err(_) => log::warn!("Shared arena still referenced, leaving file behind"),
            }
        }

        log::info!("All done! Download manager quitting...");

        if cancelled {
            return Err(Error::Aborted);
        }
        if let Some(error) = fatal {
            return Err(error);
        }
        if let Some(filename) = first_write_failure {
            return Err(Error::WriteFailed(filename));
        }
        Ok(())
    }
}

/// Feeds queued chunk downloads to the fetcher pool, bounded by twice the
/// worker count and by free arena slots.
struct Dispatcher {
    shared: Arc<Shared>,
    pool: Arc<ChunkPool>,
    chunks_to_dl: Arc<Mutex<VecDeque<u128>>>,
    chunk_urls: HashMap<u128, String>,
    dl_tx: Sender<DownloaderMsg>,
    max_active: usize,
}

impl Dispatcher {
    fn run(self) {
        while self.shared.running() {
            if self.chunks_to_dl.lock().unwrap().is_empty() {
                break;
            }

            // wait for a download slot to free up
            {
                let active = self.shared.active.lock().unwrap();
                if *active >= self.max_active {
                    log::debug!("Waiting for download tasks to complete..");
                    let _unused = self
                        .shared
                        .task_cond
                        .wait_timeout(active, QUEUE_TIMEOUT)
                        .unwrap();
                    continue;
                }
            }

            // wait for a free arena slot
            let Some(slot) = self.pool.acquire_timeout(QUEUE_TIMEOUT) else {
                log::debug!("Waiting for more shared memory...");
                continue;
            };

            let Some(guid) = self.chunks_to_dl.lock().unwrap().pop_front() else {
                self.pool.release(slot);
                break;
            };
            let Some(url) = self.chunk_urls.get(&guid) else {
                // requeued by the result handler for a chunk we never saw
                log::warn!("No URL known for chunk {:032x}, dropping", guid);
                self.pool.release(slot);
                continue;
            };

            log::debug!("Adding {:032x} (active: {})", guid, {
                *self.shared.active.lock().unwrap()
            });
            let task = DownloaderMsg::Task(DownloadTask {
                url: url.clone(),
                guid,
                slot,
            });
            match self.dl_tx.send_timeout(task, QUEUE_TIMEOUT) {
                Ok(()) => {
                    *self.shared.active.lock().unwrap() += 1;
                }
                Err(e) => {
                    log::warn!("Failed to add to download queue: {}", e);
                    self.chunks_to_dl.lock().unwrap().push_front(guid);
                    self.pool.release(slot);
                    if matches!(e, SendTimeoutError::Disconnected(_)) {
                        self.shared.record_fatal(Error::DownloadFailed(
                            "download worker queue disconnected".to_string(),
                        ));
                        self.shared.stop();
                    }
                }
            }
        }
        log::debug!("Download Job Manager quitting...");
    }
}

/// Walks the planner task stream, matching chunk tasks against arrived
/// downloads and forwarding everything to the writer in order.
struct DownloadResultHandler {
    shared: Arc<Shared>,
    pool: Option<Arc<ChunkPool>>,
    tasks: VecDeque<Task>,
    chunks_to_dl: Arc<Mutex<VecDeque<u128>>>,
    dl_result_rx: Receiver<DownloadResult>,
    dl_tx: Sender<DownloaderMsg>,
    writer_tx: Sender<WriterMsg>,
    max_retries: Option<u32>,
}

impl DownloadResultHandler {
    fn run(mut self) {
        let mut in_buffer: HashMap<u128, DownloadResult> = HashMap::new();
        let mut retries: HashMap<u128, u32> = HashMap::new();
        let mut current_file = String::new();
        let mut failed_files: BTreeSet<String> = BTreeSet::new();

        'stream: while self.shared.running() {
            let Some(task) = self.tasks.front().cloned() else {
                break;
            };

            match task {
                Task::File(ft) => {
                    let msg = WriterMsg::File {
                        filename: ft.filename.clone(),
                        old_file: ft.old_file.clone(),
                        flags: ft.flags,
                    };
                    if let Err(e) = self.writer_tx.send_timeout(msg, QUEUE_TIMEOUT) {
                        log::warn!("Adding to queue failed: {}", e);
                        self.check_writer_disconnect(&e);
                        continue;
                    }
                    if ft.flags.contains(TaskFlags::OPEN_FILE) {
                        current_file = ft.filename.clone();
                    }
                    self.tasks.pop_front();
                }
                Task::Chunk(ct) => {
                    let reuse_source = match &ct.source {
                        ChunkSource::Download => None,
                        ChunkSource::OldFile { path, offset }
                        | ChunkSource::NewFile { path, offset } => {
                            Some((path.clone(), *offset))
                        }
                    };

                    // downloaded chunks must be resident before their write
                    // can be forwarded
                    if reuse_source.is_none() && !in_buffer.contains_key(&ct.guid) {
                        self.pump_results(&mut in_buffer, &mut retries);
                        continue;
                    }

                    // a failed file takes no further data writes, but its
                    // chunks still go through cache accounting so the slots
                    // keep cycling
                    {
                        let failures = self.shared.write_failures.lock().unwrap();
                        for failure in failures.iter() {
                            failed_files.insert(failure.clone());
                        }
                    }
                    if failed_files.contains(&current_file) {
                        if ct.cleanup && reuse_source.is_none() {
                            if let Some(res) = in_buffer.remove(&ct.guid) {
                                if let Some(pool) = &self.pool {
                                    pool.release(res.task.slot);
                                }
                            }
                        }
                        self.shared.tasks_done.fetch_add(1, Ordering::SeqCst);
                        self.shared.chunks_done.fetch_add(1, Ordering::SeqCst);
                        self.shared
                            .counters
                            .tasks_processed
                            .fetch_add(1, Ordering::Relaxed);
                        self.tasks.pop_front();
                        continue 'stream;
                    }

                    let flags = if ct.cleanup {
                        TaskFlags::RELEASE_MEMORY
                    } else {
                        TaskFlags::NONE
                    };
                    let msg = match &reuse_source {
                        Some((path, offset)) => WriterMsg::Chunk(ChunkWrite {
                            filename: current_file.clone(),
                            slot: None,
                            chunk_offset: *offset,
                            chunk_size: ct.chunk_size,
                            guid: ct.guid,
                            old_file: Some(path.clone()),
                            flags,
                        }),
                        None => {
                            let res = &in_buffer[&ct.guid];
                            WriterMsg::Chunk(ChunkWrite {
                                filename: current_file.clone(),
                                slot: Some(res.task.slot),
                                chunk_offset: ct.chunk_offset,
                                chunk_size: ct.chunk_size,
                                guid: ct.guid,
                                old_file: None,
                                flags,
                            })
                        }
                    };

                    log::debug!("Adding {:032x} to writer queue", ct.guid);
                    if let Err(e) = self.writer_tx.send_timeout(msg, QUEUE_TIMEOUT) {
                        log::warn!("Adding to queue failed: {}", e);
                        self.check_writer_disconnect(&e);
                        continue;
                    }
                    if ct.cleanup && reuse_source.is_none() {
                        in_buffer.remove(&ct.guid);
                    }
                    self.tasks.pop_front();
                }
            }
        }
        log::debug!("Download result handler quitting...");
    }

    /// A vanished writer can never drain the run, so give up on it.
    fn check_writer_disconnect(&self, error: &SendTimeoutError<WriterMsg>) {
        if matches!(error, SendTimeoutError::Disconnected(_)) {
            self.shared
                .record_fatal(Error::WriteFailed("writer queue disconnected".to_string()));
            self.shared.stop();
        }
    }

    /// Absorb one batch of download results, retrying failures.
    fn pump_results(
        &self,
        in_buffer: &mut HashMap<u128, DownloadResult>,
        retries: &mut HashMap<u128, u32>,
    ) {
        let res = match self.dl_result_rx.recv_timeout(QUEUE_TIMEOUT) {
            Ok(res) => res,
            Err(_) => return,
        };

        {
            let mut active = self.shared.active.lock().unwrap();
            *active = active.saturating_sub(1);
        }
        self.shared.task_cond.notify_one();

        if res.success {
            log::debug!(
                "Download for {:032x} succeeded, adding to in_buffer...",
                res.task.guid
            );
            self.shared
                .counters
                .bytes_downloaded
                .fetch_add(res.size_downloaded, Ordering::Relaxed);
            self.shared
                .counters
                .bytes_decompressed
                .fetch_add(res.size_decompressed, Ordering::Relaxed);
            in_buffer.insert(res.task.guid, res);
            return;
        }

        log::error!("Download for {:032x} failed, retrying...", res.task.guid);
        let attempts = retries.entry(res.task.guid).or_insert(0);
        *attempts += 1;
        if let Some(cap) = self.max_retries {
            if *attempts > cap {
                self.shared.record_fatal(Error::DownloadFailed(format!(
                    "chunk {:032x} failed after {} attempts",
                    res.task.guid, attempts
                )));
                self.shared.stop();
                return;
            }
        }

        let guid = res.task.guid;
        let slot = res.task.slot;
        match self
            .dl_tx
            .send_timeout(DownloaderMsg::Task(res.task), QUEUE_TIMEOUT)
        {
            Ok(()) => {
                *self.shared.active.lock().unwrap() += 1;
            }
            Err(e) => {
                log::warn!("Failed adding retry task to queue! {}", e);
                // return the chunk to the front of the download queue
                self.chunks_to_dl.lock().unwrap().push_front(guid);
                if let Some(pool) = &self.pool {
                    pool.release(slot);
                }
                if matches!(e, SendTimeoutError::Disconnected(_)) {
                    self.shared.record_fatal(Error::DownloadFailed(
                        "download worker queue disconnected".to_string(),
                    ));
                    self.shared.stop();
                }
            }
        }
    }
}

/// Consumes writer results: journals completed files, recycles slots and
/// keeps the throughput counters fed.
struct WriteResultHandler {
    shared: Arc<Shared>,
    pool: Option<Arc<ChunkPool>>,
    writer_result_rx: Receiver<WriterResult>,
    journal: Option<ResumeJournal>,
    file_hashes: HashMap<String, String>,
    num_tasks: usize,
}

impl WriteResultHandler {
    fn run(self) {
        while self.shared.running()
            && self.shared.tasks_done.load(Ordering::SeqCst) < self.num_tasks
        {
            let res = match self.writer_result_rx.recv_timeout(QUEUE_TIMEOUT) {
                Ok(res) => res,
                Err(_) => continue,
            };
            self.handle(res);
        }
        log::debug!("Writer result handler quitting...");
    }

    fn handle(&self, res: WriterResult) {
        self.shared.tasks_done.fetch_add(1, Ordering::SeqCst);
        self.shared
            .counters
            .tasks_processed
            .fetch_add(1, Ordering::Relaxed);

        if res.flags.contains(TaskFlags::CLOSE_FILE) && res.success {
            if let Some(journal) = &self.journal {
                // temp files journal under their final name
                let filename = res.filename.strip_suffix(".tmp").unwrap_or(&res.filename);
                if let Some(file_hash) = self.file_hashes.get(filename) {
                    if let Err(e) = journal.append(file_hash, filename) {
                        log::warn!("Failed to append to resume file: {}", e);
                    }
                }
            }
        }

        if !res.success {
            log::error!("Writing for {} failed!", res.filename);
            self.shared
                .write_failures
                .lock()
                .unwrap()
                .push(res.filename.clone());
        }

        if res.flags.contains(TaskFlags::RELEASE_MEMORY) {
            if let (Some(pool), Some(slot)) = (&self.pool, res.slot) {
                pool.release(slot);
            }
        }

        if res.guid.is_some() {
            self.shared
                .counters
                .bytes_written
                .fetch_add(res.size, Ordering::Relaxed);
            if res.slot.is_none() {
                // no slot means the bytes were read back from disk
                self.shared
                    .counters
                    .bytes_read
                    .fetch_add(res.size, Ordering::Relaxed);
            }
            self.shared
                .counters
                .chunks_processed
                .fetch_add(1, Ordering::Relaxed);
            self.shared.chunks_done.fetch_add(1, Ordering::SeqCst);
        }
    }
}
