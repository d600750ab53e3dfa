use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

type Job = Box<dyn FnOnce() + Send>;

/// IoPool runs blocking chunk serializations off the ingestion threads.
/// Workers pop from a shared queue and park once it stays empty for a
/// while; a push wakes one of them back up.
pub struct IoPool {
    worker_handles: HashMap<ThreadId, JoinHandle<()>>,
    is_running: Arc<AtomicBool>,

    queue: Arc<SegQueue<Job>>,
    pending: Arc<AtomicUsize>,
    sleeping_threads: Arc<SegQueue<ThreadId>>,
}

impl IoPool {
    pub fn new(worker_count: usize) -> IoPool {
        assert!(worker_count > 0, "io pool needs at least one worker");

        let mut pool = IoPool {
            worker_handles: HashMap::new(),
            is_running: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(SegQueue::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            sleeping_threads: Arc::new(SegQueue::new()),
        };

        for _ in 0..worker_count {
            let handle = pool.spawn_worker();
            pool.worker_handles.insert(handle.thread().id(), handle);
        }

        pool
    }

    pub fn stop(self) {
        self.is_running.store(false, Ordering::Relaxed);

        for (_, handle) in self.worker_handles {
            handle.thread().unpark();
            handle.join().unwrap();
        }
    }

    pub fn push(&self, exec: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.push(exec);

        if let Some(thread) = self.sleeping_threads.pop() {
            if let Some(handle) = self.worker_handles.get(&thread) {
                handle.thread().unpark();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Blocks until every job pushed so far has finished executing.
    pub fn wait_until_processed(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_micros(500));
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let is_running = self.is_running.clone();
        let queue = self.queue.clone();
        let pending = self.pending.clone();
        let sleeping_threads = self.sleeping_threads.clone();

        thread::spawn(move || {
            let mut last_exec = Instant::now();

            while is_running.load(Ordering::Relaxed) {
                let job = queue.pop();
                if job.is_none() {
                    if last_exec.elapsed().as_millis() > 100 {
                        sleeping_threads.push(thread::current().id());
                        thread::park();
                        last_exec = Instant::now();
                    }
                    continue;
                }
                last_exec = Instant::now();

                (job.unwrap())();
                pending.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }
}
