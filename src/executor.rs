use crate::{*, error::*};
use std::{sync::{Arc, Mutex, Condvar}, thread::{self, JoinHandle}, collections::VecDeque};

// Fixed pool of worker threads running independent watch evaluations.
pub struct Executor {
    pub num_threads: usize,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return err!(Usage, "need at least one worker thread");
        }
        let mut exec = Self {num_threads, shared: Arc::new(Shared {state: Mutex::new(QueueState {tasks: VecDeque::new(), stopping: false}), wake_workers: Condvar::new()}), threads: Vec::new()};
        for _ in 0..num_threads {
            let shared_clone = exec.shared.clone();
            exec.threads.push(thread::Builder::new().name("watchworker".into()).spawn(|| Self::worker_thread(shared_clone))?);
        }
        Ok(exec)
    }

    pub fn add_boxed(&self, f: Box<dyn FnOnce() + Send>) {
        self.shared.state.lock().unwrap().tasks.push_back(Task {f});
        self.shared.wake_workers.notify_one();
    }

    pub fn add<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.add_boxed(Box::new(f));
    }

    fn worker_thread(shared: Arc<Shared>) {
        loop {
            let task;
            {
                let mut lock = shared.state.lock().unwrap();
                while lock.tasks.is_empty() && !lock.stopping {
                    lock = shared.wake_workers.wait(lock).unwrap();
                }
                match lock.tasks.pop_front() {
                    Some(t) => task = t,
                    None => return, // stopping and drained
                }
            }
            (task.f)();
        }
    }
}

impl Drop for Executor {
    // Runs the queued tasks to completion, then joins. Tasks of cancelled watches return almost immediately.
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().stopping = true;
        self.shared.wake_workers.notify_all();
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                eprintln!("warning: watch worker thread panicked");
            }
        }
    }
}

struct Task {
    f: Box<dyn FnOnce() + Send>,
}

struct QueueState {
    tasks: VecDeque<Task>,
    stopping: bool,
}

struct Shared {
    // At most a few hundred watches per UI update, so nothing fancy.
    state: Mutex<QueueState>,
    wake_workers: Condvar,
}
