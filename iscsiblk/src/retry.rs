use std::thread;
use std::time::Duration;

use anyhow::Result;

/// Result of a single attempt inside [`Retry::run`].
pub enum Attempt<T> {
    /// stop retrying with this value
    Done(T),
    /// try again after the interval, remembering why this attempt failed
    Again(anyhow::Error),
}

/// Bounded retry with a fixed delay between attempts.
///
/// An `Err` returned by the attempt closure aborts immediately. Once all
/// attempts are used up the error from the last `Attempt::Again` is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    count: usize,
    interval: Duration,
}

impl Retry {
    pub fn new(count: usize, interval: Duration) -> Self {
        Retry {
            count: count.max(1),
            interval,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// runs `attempt` up to `count` times, the argument is the attempt index
    pub fn run<T, F>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(usize) -> Result<Attempt<T>>,
    {
        let mut last = None;
        for i in 0..self.count {
            if i > 0 && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
            match attempt(i)? {
                Attempt::Done(v) => return Ok(v),
                Attempt::Again(e) => last = Some(e),
            }
        }

        Err(last.unwrap_or_else(|| anyhow::anyhow!("retry gave up without an attempt")))
    }

    /// polls `ready` until it returns true, otherwise fails with `on_exhausted`
    pub fn poll<F, E>(&self, mut ready: F, on_exhausted: E) -> Result<()>
    where
        F: FnMut() -> bool,
        E: Fn() -> anyhow::Error,
    {
        self.run(|_| {
            if ready() {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Again(on_exhausted()))
            }
        })
    }
}
