// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thread pool running the worker-reactor loops and auxiliary tasks.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Minimum number of threads kept in the pool.
pub const MIN_POOL_SIZE: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads consuming queued jobs. Dropping the
/// pool closes the queue and joins every worker; in-flight jobs finish
/// first.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    job_tx: Option<Sender<Job>>,
}

impl ThreadPool {
    /// Spawns `size` workers, clamped up to [`MIN_POOL_SIZE`].
    pub fn new(size: usize) -> Self {
        let size = size.max(MIN_POOL_SIZE);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = (0..size)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                thread::spawn(move || loop {
                    let job = {
                        let Ok(receiver) = job_rx.lock() else {
                            log::error!("thread pool: could not take a lock on mutex");
                            break;
                        };
                        match receiver.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    job();
                })
            })
            .collect();
        Self {
            workers,
            job_tx: Some(job_tx),
        }
    }

    /// Hardware concurrency minus one (the listener keeps the main thread),
    /// never below [`MIN_POOL_SIZE`].
    pub fn default_size() -> usize {
        thread::available_parallelism()
            .map_or(MIN_POOL_SIZE, |n| n.get().saturating_sub(1))
            .max(MIN_POOL_SIZE)
    }

    /// Queues a job for the next idle worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(job_tx) = &self.job_tx {
            if job_tx.send(Box::new(job)).is_err() {
                log::error!("thread pool: job submitted after shutdown");
            }
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.job_tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_every_queued_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4);
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn size_is_clamped_to_the_minimum() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.size(), MIN_POOL_SIZE);
    }

    #[test]
    fn default_size_leaves_a_thread_for_the_listener() {
        assert!(ThreadPool::default_size() >= MIN_POOL_SIZE);
    }
}
