//! Asynchronous append-only log file.
//!
//! Producers append byte strings to a front buffer under a short lock and
//! return without touching the kernel. A dedicated flusher thread swaps the
//! front buffer for an empty back buffer and drains the back buffer to the
//! descriptor, one write syscall per cycle plus short-write retries. The
//! flusher is the only thread that touches the descriptor, so the
//! close-and-open of a reopen can never race an in-flight write.
//!
//! The flusher wakes for four reasons: the periodic timer fired, a single
//! oversized write arrived, flush() was called, or reopen() was called.
//! Syscall failures never reach producers; they are counted and the bytes
//! involved are dropped.

use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use libc;
use tracing::{debug, warn};

use crate::api::OsCalls;
use crate::dispatch::{Dispatcher, Timer};
use crate::stats::{Counter, Scope};
use crate::Error;

/// A single write strictly larger than this is handed to the flusher
/// immediately instead of waiting for the next timer fire.
pub const FLUSH_SIZE_THRESHOLD: usize = 64 * 1024;

const OPEN_FLAGS: libc::c_int = libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT;
const OPEN_MODE: libc::mode_t = libc::S_IRUSR | libc::S_IWUSR | libc::S_IRGRP | libc::S_IROTH;

struct FileStats {
    write_buffered: Counter,
    write_completed: Counter,
    write_failed: Counter,
    reopen_failed: Counter,
    flushed_by_timer: Counter,
}

impl FileStats {
    fn new(scope: &dyn Scope) -> FileStats {
        FileStats {
            write_buffered: scope.counter("write_buffered"),
            write_completed: scope.counter("write_completed"),
            write_failed: scope.counter("write_failed"),
            reopen_failed: scope.counter("reopen_failed"),
            flushed_by_timer: scope.counter("flushed_by_timer"),
        }
    }
}

struct CoordState {
    flush_requested: bool,
    reopen_pending: bool,
    shutting_down: bool,
    timer_armed: bool,
    /// True once the flusher has completed its first cycle. Until then the
    /// flusher also wakes for a non-empty front buffer, so a lone write that
    /// precedes any timer fire still reaches the descriptor.
    primed: bool,
    work_pending: bool,
    request_serial: u64,
    completed_serial: u64,
}

struct Inner {
    path: PathBuf,
    flush_interval: Duration,
    os: Arc<dyn OsCalls>,
    /// Front buffer lock. Held only for append and swap, never across a
    /// syscall.
    front: Mutex<BytesMut>,
    coord: Mutex<CoordState>,
    work_available: Condvar,
    cycle_complete: Condvar,
    /// Negative means no descriptor. Mutated only by the flusher while it
    /// runs; the destructor closes it after the join.
    descriptor: Mutex<libc::c_int>,
    timer: Mutex<Option<Arc<dyn Timer>>>,
    stats: FileStats,
}

/// Append-only log file with a non-blocking producer API.
///
/// write() may be called from any thread and returns once the payload is
/// buffered. flush() blocks until everything buffered at the time of the
/// call has been handed to the OS. reopen() asks the flusher to close the
/// descriptor and open the configured path again; it is the log-rotation
/// signal and does not block.
pub struct AsyncFile {
    inner: Arc<Inner>,
    flusher: Option<thread::JoinHandle<()>>,
}

impl AsyncFile {
    /// Opens the file and spawns the flusher thread.
    ///
    /// The initial open happens synchronously through os_calls; a negative
    /// descriptor fails construction and no flusher is started.
    pub fn new(
        path: PathBuf,
        dispatcher: &dyn Dispatcher,
        os_calls: Arc<dyn OsCalls>,
        scope: &dyn Scope,
        flush_interval: Duration,
    ) -> Result<AsyncFile, Error> {
        let inner = Arc::new(Inner {
            path,
            flush_interval,
            os: os_calls,
            front: Mutex::new(BytesMut::new()),
            coord: Mutex::new(CoordState {
                flush_requested: false,
                reopen_pending: false,
                shutting_down: false,
                timer_armed: false,
                primed: false,
                work_pending: false,
                request_serial: 0,
                completed_serial: 0,
            }),
            work_available: Condvar::new(),
            cycle_complete: Condvar::new(),
            descriptor: Mutex::new(-1),
            timer: Mutex::new(None),
            stats: FileStats::new(scope),
        });

        let timer = {
            let weak = Arc::downgrade(&inner);
            dispatcher.create_timer(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer();
                }
            }))
        };
        *inner.timer.lock().unwrap() = Some(timer);

        let fd = inner.os.open(&inner.path, OPEN_FLAGS, OPEN_MODE);
        if fd < 0 {
            return Err(Error::Open {
                path: inner.path.clone(),
                source: io::Error::last_os_error(),
            });
        }
        *inner.descriptor.lock().unwrap() = fd;

        let flusher_inner = inner.clone();
        let flusher = thread::spawn(move || flusher_inner.run_flusher());

        Ok(AsyncFile {
            inner,
            flusher: Some(flusher),
        })
    }

    /// Appends the payload to the front buffer. Never blocks on I/O and
    /// never fails; the bytes of one call stay contiguous and in order in
    /// the output.
    pub fn write(&self, data: &[u8]) {
        self.inner.write(data);
    }

    /// Blocks until a flush cycle that began no earlier than this call has
    /// completed, i.e. until everything buffered at call entry has been
    /// written to the OS or discarded.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Asks the flusher to close the current descriptor and open the
    /// configured path again. Returns immediately; writes made in the
    /// meantime keep accumulating and are directed at the new descriptor.
    pub fn reopen(&self) {
        self.inner.reopen();
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        {
            let mut state = self.inner.coord.lock().unwrap();
            state.shutting_down = true;
        }
        self.inner.work_available.notify_all();
        self.inner.cycle_complete.notify_all();

        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }

        let mut fd = self.inner.descriptor.lock().unwrap();
        if *fd >= 0 {
            self.inner.os.close(*fd);
            *fd = -1;
        }
    }
}

impl Inner {
    fn write(&self, data: &[u8]) {
        {
            let mut front = self.front.lock().unwrap();
            front.extend_from_slice(data);
        }
        self.stats.write_buffered.add(data.len() as u64);

        // Trigger checks happen outside the front lock.
        let oversized = data.len() > FLUSH_SIZE_THRESHOLD;
        let mut wake = oversized;
        let mut arm_timer = false;
        {
            let mut state = self.coord.lock().unwrap();
            if oversized {
                state.flush_requested = true;
            }
            if !state.primed {
                state.work_pending = true;
                wake = true;
            }
            if !state.timer_armed {
                state.timer_armed = true;
                arm_timer = true;
            }
        }

        if wake {
            self.work_available.notify_one();
        }
        if arm_timer {
            self.enable_timer();
        }
    }

    fn flush(&self) {
        let mut state = self.coord.lock().unwrap();
        if state.shutting_down {
            return;
        }

        state.request_serial += 1;
        let target = state.request_serial;
        state.flush_requested = true;
        self.work_available.notify_one();

        while state.completed_serial < target && !state.shutting_down {
            state = self.cycle_complete.wait(state).unwrap();
        }
    }

    fn reopen(&self) {
        {
            let mut state = self.coord.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.reopen_pending = true;
        }
        self.work_available.notify_one();
    }

    fn on_timer(&self) {
        {
            let mut state = self.coord.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.flush_requested = true;
        }
        self.stats.flushed_by_timer.inc();
        self.work_available.notify_one();
        self.enable_timer();
    }

    fn enable_timer(&self) {
        let timer = self.timer.lock().unwrap().clone();
        if let Some(timer) = timer {
            timer.enable(self.flush_interval);
        }
    }

    fn run_flusher(&self) {
        let mut back = BytesMut::new();

        loop {
            let (do_reopen, shutting_down, serial) = {
                // ---------- Lock coordination mutex ----------
                let mut state = self.coord.lock().unwrap();

                while !work_ready(&state) {
                    state = self.work_available.wait(state).unwrap();
                }

                let do_reopen = state.reopen_pending;
                state.reopen_pending = false;
                state.flush_requested = false;
                state.work_pending = false;

                (do_reopen, state.shutting_down, state.request_serial)
            }; // ---------- Unlock coordination mutex ----------

            if do_reopen {
                self.reopen_descriptor();
            }

            self.drain(&mut back);

            {
                let mut state = self.coord.lock().unwrap();
                state.primed = true;
                if serial > state.completed_serial {
                    state.completed_serial = serial;
                }
                self.cycle_complete.notify_all();
            }

            if shutting_down {
                return;
            }
        }
    }

    /// Swaps the buffers and writes the back buffer out. The swap happens
    /// only when the back buffer is empty; the back buffer is always empty
    /// again when this returns.
    fn drain(&self, back: &mut BytesMut) {
        {
            let mut front = self.front.lock().unwrap();
            if front.is_empty() {
                return;
            }
            mem::swap(&mut *front, back);
        }

        let fd = *self.descriptor.lock().unwrap();
        if fd < 0 {
            self.stats.write_failed.add(back.len() as u64);
            back.clear();
            return;
        }

        let mut offset = 0;
        while offset < back.len() {
            let n = self.os.write(fd, &back[offset..]);
            if n <= 0 {
                let dropped = back.len() - offset;
                self.stats.write_failed.add(dropped as u64);
                warn!(fd, dropped, "log write failed, discarding buffered bytes");
                break;
            }
            offset += n as usize;
            self.stats.write_completed.add(n as u64);
        }
        back.clear();
    }

    fn reopen_descriptor(&self) {
        let mut fd = self.descriptor.lock().unwrap();
        if *fd >= 0 {
            self.os.close(*fd);
        }

        *fd = self.os.open(&self.path, OPEN_FLAGS, OPEN_MODE);
        if *fd < 0 {
            self.stats.reopen_failed.inc();
            warn!(
                path = %self.path.display(),
                "log reopen failed, writes will be discarded until the next reopen"
            );
        } else {
            debug!(fd = *fd, path = %self.path.display(), "log file reopened");
        }
    }
}

fn work_ready(state: &CoordState) -> bool {
    state.flush_requested
        || state.reopen_pending
        || state.shutting_down
        || (!state.primed && state.work_pending)
}
