//! One-shot timers on a reference thread.
//!
//! The file writer's periodic flush trigger is a one-shot timer that the
//! timer's own callback rearms after signalling the flusher. The Dispatcher
//! and Timer traits are the injection seam; ThreadDispatcher is the real
//! implementation, a single worker thread that sleeps until the nearest
//! deadline and runs due callbacks in its own context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::crossbeam_channel;
use crossbeam::crossbeam_channel::RecvTimeoutError;

pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

/// A one-shot timer. Enabling an already-armed timer replaces its deadline.
/// The callback runs on the dispatcher's reference thread and may call
/// enable again to rearm.
pub trait Timer: Send + Sync {
    fn enable(&self, period: Duration);
}

/// Factory for timers bound to one reference thread.
pub trait Dispatcher: Send + Sync {
    fn create_timer(&self, callback: TimerCallback) -> Arc<dyn Timer>;
}

enum Command {
    Register(usize, TimerCallback),
    Arm(usize, Instant),
    Terminate,
}

/// Dispatcher backed by a dedicated thread. Dropping it stops the thread;
/// timers created from it become inert once the thread is gone.
pub struct ThreadDispatcher {
    sender: crossbeam_channel::Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
    next_id: AtomicUsize,
}

impl ThreadDispatcher {
    pub fn new() -> ThreadDispatcher {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = thread::spawn(move || run(receiver));
        ThreadDispatcher {
            sender,
            thread: Some(thread),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn create_timer(&self, callback: TimerCallback) -> Arc<dyn Timer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Explicitly ignore any errors
        let _ = self.sender.send(Command::Register(id, callback));
        Arc::new(ThreadTimer {
            id,
            sender: self.sender.clone(),
        })
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Terminate);
        self.thread.take().map(|t| t.join());
    }
}

struct ThreadTimer {
    id: usize,
    sender: crossbeam_channel::Sender<Command>,
}

impl Timer for ThreadTimer {
    fn enable(&self, period: Duration) {
        // Explicitly ignore any errors
        let _ = self.sender.send(Command::Arm(self.id, Instant::now() + period));
    }
}

fn run(receiver: crossbeam_channel::Receiver<Command>) {
    let mut callbacks: HashMap<usize, TimerCallback> = HashMap::new();
    let mut armed: HashMap<usize, Instant> = HashMap::new();

    loop {
        let now = Instant::now();
        let due: Vec<usize> = armed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            armed.remove(&id);
            if let Some(callback) = callbacks.get(&id) {
                callback();
            }
        }

        let command = match armed.values().min().cloned() {
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    continue;
                }
                match receiver.recv_timeout(deadline - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };

        match command {
            Command::Register(id, callback) => {
                callbacks.insert(id, callback);
            }
            Command::Arm(id, deadline) => {
                armed.insert(id, deadline);
            }
            Command::Terminate => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn fires_once_per_enable() {
        let dispatcher = ThreadDispatcher::new();
        let (sender, receiver) = crossbeam_channel::unbounded();

        let timer = dispatcher.create_timer(Box::new(move || {
            let _ = sender.send(());
        }));

        timer.enable(Duration::from_millis(10));
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());

        // One-shot: no further fire until rearmed
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

        timer.enable(Duration::from_millis(10));
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn callback_can_rearm_its_own_timer() {
        let dispatcher = ThreadDispatcher::new();
        let (sender, receiver) = crossbeam_channel::unbounded();

        let slot: Arc<Mutex<Option<Arc<dyn Timer>>>> = Arc::new(Mutex::new(None));
        let callback_slot = slot.clone();

        let timer = dispatcher.create_timer(Box::new(move || {
            let _ = sender.send(());
            if let Some(timer) = callback_slot.lock().unwrap().clone() {
                timer.enable(Duration::from_millis(5));
            }
        }));

        *slot.lock().unwrap() = Some(timer.clone());
        timer.enable(Duration::from_millis(5));

        for _ in 0..3 {
            assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());
        }
    }

    #[test]
    fn timers_survive_unrelated_arms() {
        let dispatcher = ThreadDispatcher::new();
        let (s1, r1) = crossbeam_channel::unbounded();
        let (s2, r2) = crossbeam_channel::unbounded();

        let t1 = dispatcher.create_timer(Box::new(move || {
            let _ = s1.send(());
        }));
        let t2 = dispatcher.create_timer(Box::new(move || {
            let _ = s2.send(());
        }));

        t1.enable(Duration::from_millis(20));
        t2.enable(Duration::from_millis(5));

        assert!(r2.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(r1.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
