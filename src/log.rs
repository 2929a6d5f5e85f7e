use std::{collections::VecDeque, time::Instant};

// Warnings produced while evaluating one watch: unknown rules, malformed rule arguments, hooks that gave up.
// Not a server-style log. Each pipeline run gets its own instance, and the UI shows the lines next to the watch.
// Things only interesting to the developer (unexpected type shapes etc) go to stderr instead.
pub struct Log {
    pub lines: VecDeque<String>,
}

const MAX_LINES: usize = 100;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new()}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn take(&mut self) -> Vec<String> { self.lines.drain(..).collect() }
}

#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// A very minimal profiling thing. Prints to stderr in destructor if the scope took longer than the threshold.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
}

impl ProfileScope {
    pub fn with_threshold(secs: f64, name: String) -> Self {
        ProfileScope {name, start: Instant::now(), threshold_secs: secs}
    }

    pub fn elapsed_secs(&self) -> f64 { self.start.elapsed().as_secs_f64() }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let secs = self.elapsed_secs();
        if secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}ms", self.name, secs * 1e3);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, log::*};

    #[test]
    fn ring_buffer() {
        let mut l = Log::new();
        for i in 0..150 {
            log!(l, "warning {}", i);
        }
        assert_eq!(l.lines.len(), MAX_LINES);
        assert_eq!(l.lines.front().unwrap(), "warning 50");
        let taken = l.take();
        assert_eq!(taken.len(), MAX_LINES);
        assert!(l.lines.is_empty());
    }
}
