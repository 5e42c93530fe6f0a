//! The event-loop service: one dedicated thread per [`Arbitrator`] running a
//! current-thread tokio runtime, a FIFO job channel bridging caller threads
//! onto it, and the [`Awakener`] thread that performs every broadcast of the
//! shared listener condition.

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::connection::{run_connection, Connection, ConnectionOptions, Shared};
use crate::error::{Error, Result};
use crate::transport::Transport;

type Job = Box<dyn FnOnce() + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

/// The application-facing wait/notify pair: a generation counter guarded by a
/// mutex, broadcast on by the Awakener only.
pub(crate) type Condition = (Mutex<u64>, Condvar);

/// Owns the single event-loop thread all connections created through it share.
///
/// Explicitly constructed and injectable; build one per process (or per test)
/// and call [`Arbitrator::shutdown`] when done with it.
pub struct Arbitrator {
    jobs: mpsc::UnboundedSender<Command>,
    handle: tokio::runtime::Handle,
    loop_thread: ThreadId,
    loop_join: Mutex<Option<JoinHandle<()>>>,
    condition: Arc<Condition>,
    awakener: Awakener,
}

impl Arbitrator {
    /// Spawn the loop thread and block until its runtime is up.
    pub fn new() -> Result<Arc<Arbitrator>> {
        let (jobs, mut job_rx) = mpsc::unbounded_channel::<Command>();
        let (init_tx, init_rx) = std_mpsc::sync_channel(1);

        let join = thread::Builder::new()
            .name("perch-loop".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(Error::LoopClosed));
                        error!("failed to build loop runtime: {e}");
                        return;
                    }
                };
                let _ = init_tx.send(Ok((rt.handle().clone(), thread::current().id())));
                rt.block_on(async move {
                    while let Some(cmd) = job_rx.recv().await {
                        match cmd {
                            Command::Run(job) => job(),
                            Command::Shutdown => break,
                        }
                    }
                });
                debug!("event loop exited");
            })
            .map_err(|_| Error::LoopClosed)?;

        let (handle, loop_thread) = init_rx.recv().map_err(|_| Error::LoopClosed)??;
        let condition = Arc::new((Mutex::new(0u64), Condvar::new()));
        let awakener = Awakener::start(condition.clone());

        Ok(Arc::new(Arbitrator {
            jobs,
            handle,
            loop_thread,
            loop_join: Mutex::new(Some(join)),
            condition,
            awakener,
        }))
    }

    /// Whether the current thread is the loop thread.
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Schedule `f` on the loop thread, fire-and-forget. Runs in place when
    /// already on the loop thread.
    pub fn run_async(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.on_loop_thread() {
            f();
            return Ok(());
        }
        self.jobs
            .send(Command::Run(Box::new(f)))
            .map_err(|_| Error::LoopClosed)
    }

    /// Run `f` on the loop thread and block for its result. Runs in place when
    /// already on the loop thread, so loop-side callbacks can never deadlock
    /// against themselves.
    pub fn run_sync<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Result<T> {
        if self.on_loop_thread() {
            return Ok(f());
        }
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.jobs
            .send(Command::Run(Box::new(move || {
                let _ = tx.send(f());
            })))
            .map_err(|_| Error::LoopClosed)?;
        rx.recv().map_err(|_| Error::LoopClosed)
    }

    /// Open a connection. Blocks the caller until the transport handshake
    /// resolves, except on the loop thread itself where it returns as soon as
    /// the connect is scheduled (the connection flips to open asynchronously).
    pub fn create_connection<T, F, Fut>(
        self: &Arc<Self>,
        options: ConnectionOptions,
        connect: F,
    ) -> Result<Connection>
    where
        T: Transport,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = Arc::new(Shared::new(self.clone(), options));
        shared.state().lock().unwrap().begin_handshake();

        let (tx, rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let task_shared = shared.clone();
        self.spawn(async move {
            match connect().await {
                Ok(transport) => {
                    let out_rx = task_shared.attach_outbound();
                    task_shared.state().lock().unwrap().on_transport_open();
                    let _ = tx.send(Ok(()));
                    run_connection(task_shared, transport, out_rx).await;
                }
                Err(e) => {
                    debug!("connect failed: {e}");
                    task_shared.state().lock().unwrap().mark_closed();
                    let _ = tx.send(Err(e));
                }
            }
        });

        if self.on_loop_thread() {
            return Ok(Connection::new(shared));
        }
        match rx.recv() {
            Ok(Ok(())) => Ok(Connection::new(shared)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::LoopClosed),
        }
    }

    /// Spawn a future on the loop runtime.
    pub(crate) fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.handle.spawn(fut);
    }

    pub(crate) fn condition(&self) -> &Arc<Condition> {
        &self.condition
    }

    /// Request one broadcast of the shared condition, performed off-loop by
    /// the Awakener. Never blocks.
    pub(crate) fn awaken(&self) {
        self.awakener.signal();
    }

    /// Stop the loop and the Awakener. Connections created through this
    /// arbitrator must be closed first; pending jobs are still drained.
    pub fn shutdown(&self) {
        let _ = self.jobs.send(Command::Shutdown);
        if let Some(join) = self.loop_join.lock().unwrap().take() {
            if !self.on_loop_thread() {
                let _ = join.join();
            }
        }
        self.awakener.stop();
    }
}

impl Drop for Arbitrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Helper thread that performs every `notify_all` on the shared condition.
///
/// Broadcasting reacquires the condition mutex; doing that on the loop thread
/// while a woken listener calls back into the loop can deadlock. All
/// broadcasts therefore happen here, on a thread that is never the loop
/// thread and never an application thread. Signals may coalesce; waiters
/// always re-check their wake condition in a loop.
struct Awakener {
    pending: Arc<(Mutex<AwakenerState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct AwakenerState {
    count: u64,
    stop: bool,
}

impl Awakener {
    fn start(shared: Arc<Condition>) -> Awakener {
        let pending: Arc<(Mutex<AwakenerState>, Condvar)> = Arc::default();
        let thread_pending = pending.clone();
        let thread = thread::Builder::new()
            .name("perch-awakener".into())
            .spawn(move || loop {
                {
                    let (lock, cue) = &*thread_pending;
                    let mut st = lock.lock().unwrap();
                    loop {
                        if st.stop {
                            return;
                        }
                        if st.count > 0 {
                            st.count -= 1;
                            break;
                        }
                        st = cue.wait(st).unwrap();
                    }
                }
                // Take the condition mutex so a broadcast can never slip
                // between a waiter's check and its wait.
                let (cond_lock, cond) = &*shared;
                let mut generation = cond_lock.lock().unwrap();
                *generation = generation.wrapping_add(1);
                cond.notify_all();
            })
            .ok();
        Awakener {
            pending,
            thread: Mutex::new(thread),
        }
    }

    fn signal(&self) {
        let (lock, cue) = &*self.pending;
        let mut st = lock.lock().unwrap();
        st.count += 1;
        cue.notify_one();
    }

    fn stop(&self) {
        {
            let (lock, cue) = &*self.pending;
            let mut st = lock.lock().unwrap();
            st.stop = true;
            cue.notify_one();
        }
        if let Some(join) = self.thread.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn run_sync_returns_loop_result() {
        let arb = Arbitrator::new().unwrap();
        let out = arb.run_sync(|| 41 + 1).unwrap();
        assert_eq!(out, 42);
        arb.shutdown();
    }

    #[test]
    fn run_sync_reports_thread_identity() {
        let arb = Arbitrator::new().unwrap();
        let caller = thread::current().id();
        let loop_id = arb.run_sync(thread::current).unwrap().id();
        assert_ne!(caller, loop_id);
        arb.shutdown();
    }

    #[test]
    fn nested_sync_calls_take_the_fast_path() {
        // A sync call issued from a scheduled callable must execute in place
        // instead of deadlocking against the loop.
        let arb = Arbitrator::new().unwrap();
        let inner = arb.clone();
        let out = arb
            .run_sync(move || {
                assert!(inner.on_loop_thread());
                inner.run_sync(|| 7).unwrap()
            })
            .unwrap();
        assert_eq!(out, 7);
        arb.shutdown();
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let arb = Arbitrator::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = seen.clone();
            arb.run_async(move || seen.lock().unwrap().push(i)).unwrap();
        }
        // A trailing sync call flushes the FIFO.
        arb.run_sync(|| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
        arb.shutdown();
    }

    #[test]
    fn awakener_wakes_a_waiter() {
        let arb = Arbitrator::new().unwrap();
        let cond = arb.condition().clone();
        let woken = Arc::new(AtomicUsize::new(0));
        let waiter_woken = woken.clone();
        let waiter = thread::spawn(move || {
            let (lock, cvar) = &*cond;
            let mut generation = lock.lock().unwrap();
            let start = *generation;
            while *generation == start {
                generation = cvar.wait(generation).unwrap();
            }
            waiter_woken.store(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        arb.awaken();
        waiter.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        arb.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let arb = Arbitrator::new().unwrap();
        arb.shutdown();
        assert!(matches!(arb.run_sync(|| ()), Err(Error::LoopClosed)));
    }
}
