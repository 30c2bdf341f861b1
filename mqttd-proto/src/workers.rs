use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use log::{debug, error, trace};
use parking_lot::Mutex;

/// Sizing of the elastic worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Threads started immediately; the pool never shrinks below this.
    pub initial: usize,
    /// Hard ceiling on concurrently running threads.
    pub max_limit: usize,
    /// Threads added per growth step.
    pub step_add: usize,
    /// How long a backlog must persist before a growth step fires.
    pub step_period: Duration,
    /// How long an extra thread may sit idle before it expires.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial: 2,
            max_limit: 32,
            step_add: 2,
            step_period: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

enum Task {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

struct PoolState {
    workers: usize,
    backlog_since: Option<Instant>,
    shutting_down: bool,
}

/// Bounded elastic task pool.
///
/// Tasks queue on a channel; workers dequeue and run them behind a panic
/// firewall, so a misbehaving user callback never takes the process
/// down. The reader loop calls [`WorkerPool::balance`] every wakeup:
/// when the queue has been non-empty for `step_period`, `step_add`
/// threads are added up to `max_limit`. Extra threads expire after
/// `idle_timeout` of silence. There is no forced cancellation; long
/// tasks are expected to poll their context's exit flag.
pub struct WorkerPool {
    tx: channel::Sender<Task>,
    rx: channel::Receiver<Task>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (tx, rx) = channel::unbounded();

        let pool = Arc::new(WorkerPool {
            tx,
            rx,
            state: Mutex::new(PoolState {
                workers: 0,
                backlog_since: None,
                shutting_down: false,
            }),
            config,
        });

        for _ in 0..pool.config.initial.max(1) {
            pool.spawn_worker(false);
        }

        pool
    }

    /// Queues a task for execution on some worker.
    pub fn execute<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.lock().shutting_down {
            return;
        }
        // the queue is unbounded, so this only fails once every worker is
        // gone after shutdown
        let _ = self.tx.send(Task::Run(Box::new(task)));
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.state.lock().workers
    }

    /// Queued tasks not yet picked up.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    /// Grows the pool when the backlog has persisted for a full step period.
    pub fn balance(self: &Arc<Self>) {
        let now = Instant::now();
        let mut grow = 0;

        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }

            if self.rx.is_empty() {
                state.backlog_since = None;
            } else {
                match state.backlog_since {
                    None => state.backlog_since = Some(now),
                    Some(since) if now.duration_since(since) >= self.config.step_period => {
                        let headroom = self.config.max_limit.saturating_sub(state.workers);
                        grow = self.config.step_add.min(headroom);
                        state.backlog_since = None;
                    }
                    Some(_) => {}
                }
            }
        }

        if grow > 0 {
            debug!("worker pool growing by {} (backlog {})", grow, self.rx.len());
            for _ in 0..grow {
                self.spawn_worker(true);
            }
        }
    }

    /// Stops every worker after the queue drains.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.workers
        };

        for _ in 0..workers {
            let _ = self.tx.send(Task::Stop);
        }
    }

    fn spawn_worker(self: &Arc<Self>, elastic: bool) {
        let pool = Arc::clone(self);

        {
            let mut state = self.state.lock();
            if state.shutting_down || state.workers >= self.config.max_limit.max(1) {
                return;
            }
            state.workers += 1;
        }

        let pool_for_error = Arc::clone(&pool);
        thread::Builder::new()
            .name("mqttd-worker".to_owned())
            .spawn(move || pool.worker_main(elastic))
            .map(|_| ())
            .unwrap_or_else(|err| {
                error!("failed to spawn worker thread: {}", err);
                pool_for_error.state.lock().workers -= 1;
            });
    }

    fn worker_main(self: Arc<Self>, elastic: bool) {
        trace!("worker up (elastic: {})", elastic);

        loop {
            match self.rx.recv_timeout(self.config.idle_timeout) {
                Ok(Task::Run(task)) => {
                    // the task boundary is the error firewall: a panicking
                    // handler or user callback is logged and contained
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("worker task panicked");
                    }
                }
                Ok(Task::Stop) => break,
                Err(channel::RecvTimeoutError::Timeout) => {
                    if elastic {
                        let mut state = self.state.lock();
                        if state.workers > self.config.initial.max(1) {
                            break;
                        }
                    }
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        self.state.lock().workers -= 1;
        trace!("worker down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_tasks_run() {
        let pool = WorkerPool::new(Default::default());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_until("tasks to finish", || counter.load(Ordering::SeqCst) == 16);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_contained() {
        let pool = WorkerPool::new(Default::default());
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom"));

        let after = Arc::clone(&counter);
        pool.execute(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });

        wait_until("pool to survive a panic", || counter.load(Ordering::SeqCst) == 1);
        pool.shutdown();
    }

    #[test]
    fn test_balance_grows_under_backlog() {
        let pool = WorkerPool::new(PoolConfig {
            initial: 1,
            max_limit: 4,
            step_add: 2,
            step_period: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(60),
        });

        // wedge the single worker and pile up a backlog
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        pool.execute(move || {
            let _ = release_rx.recv();
        });
        for _ in 0..8 {
            pool.execute(|| {});
        }

        pool.balance(); // starts the backlog clock
        thread::sleep(Duration::from_millis(20));
        pool.balance(); // period elapsed, grow

        wait_until("pool growth", || pool.workers() >= 3);

        drop(release_tx);
        pool.shutdown();
    }
}
