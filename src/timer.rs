// src/timer.rs

//! Retry/backoff timer shared by task tries, job polling and event handlers.

use std::fmt;

use crate::wallclock;

/// A schedule of delays with an attempt counter.
///
/// - `next()` consumes one delay and sets the due time to `now + delay`.
/// - Once every delay has been consumed `next()` returns `None`
///   (exhausted) unless asked to keep reusing the last delay.
/// - `waiting` marks a timer whose action is currently in flight.
///
/// `C` is an opaque context handed back to whoever fires the timer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTimer<C> {
    ctx: C,
    delays: Vec<f64>,
    num: usize,
    delay: Option<f64>,
    timeout: Option<f64>,
    is_waiting: bool,
}

impl<C> RetryTimer<C> {
    pub fn new(ctx: C, delays: Vec<f64>) -> Self {
        Self {
            ctx,
            delays,
            num: 0,
            delay: None,
            timeout: None,
            is_waiting: false,
        }
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn delays(&self) -> &[f64] {
        &self.delays
    }

    /// Number of delays consumed so far.
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn set_num(&mut self, num: usize) {
        self.num = num;
    }

    pub fn delay(&self) -> Option<f64> {
        self.delay
    }

    pub fn timeout(&self) -> Option<f64> {
        self.timeout
    }

    pub fn is_waiting(&self) -> bool {
        self.is_waiting
    }

    pub fn is_timeout_set(&self) -> bool {
        self.timeout.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.num >= self.delays.len()
    }

    pub fn next(&mut self, no_exhaust: bool) -> Option<f64> {
        self.next_at(wallclock::now(), no_exhaust)
    }

    /// Arm the timer relative to `now` and return the new due time.
    pub fn next_at(&mut self, now: f64, no_exhaust: bool) -> Option<f64> {
        let delay = if self.num >= self.delays.len() {
            if !no_exhaust {
                return None;
            }
            *self.delays.last()?
        } else {
            let d = self.delays[self.num];
            self.num += 1;
            d
        };
        self.delay = Some(delay);
        let due = now + delay;
        self.timeout = Some(due);
        Some(due)
    }

    pub fn is_delay_done(&self) -> bool {
        self.is_delay_done_at(wallclock::now())
    }

    pub fn is_delay_done_at(&self, now: f64) -> bool {
        matches!(self.timeout, Some(t) if now >= t)
    }

    pub fn reset(&mut self) {
        self.num = 0;
        self.delay = None;
        self.timeout = None;
        self.is_waiting = false;
    }

    /// Action submitted: stop counting down until the outcome is known.
    pub fn set_waiting(&mut self) {
        self.is_waiting = true;
        self.timeout = None;
    }

    pub fn unset_waiting(&mut self) {
        self.is_waiting = false;
    }

    /// `PT5M (after 2026-01-01T00:05:00Z)` style description.
    pub fn delay_timeout_as_str(&self) -> String {
        match (self.delay, self.timeout) {
            (Some(delay), Some(timeout)) => format!(
                "{} (after {})",
                wallclock::interval_as_str(delay),
                wallclock::time_string(timeout)
            ),
            _ => "(not set)".to_string(),
        }
    }
}

impl<C> fmt::Display for RetryTimer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryTimer(num={}, delays={:?}, waiting={})",
            self.num, self.delays, self.is_waiting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_all_delays() {
        let mut t = RetryTimer::new((), vec![1.0, 2.0]);
        assert_eq!(t.next_at(100.0, false), Some(101.0));
        assert_eq!(t.next_at(100.0, false), Some(102.0));
        assert_eq!(t.num(), 2);
        assert_eq!(t.next_at(100.0, false), None);
        assert!(t.is_exhausted());
    }

    #[test]
    fn no_exhaust_reuses_last_delay() {
        let mut t = RetryTimer::new((), vec![5.0]);
        t.next_at(0.0, true);
        assert_eq!(t.next_at(10.0, true), Some(15.0));
        assert_eq!(t.num(), 1);
    }

    #[test]
    fn waiting_clears_timeout() {
        let mut t = RetryTimer::new("ctx", vec![0.0]);
        t.next_at(10.0, false);
        assert!(t.is_delay_done_at(10.0));
        assert!(!t.is_delay_done_at(9.0));
        t.set_waiting();
        assert!(t.is_waiting());
        assert!(!t.is_timeout_set());
        t.unset_waiting();
        assert!(!t.is_waiting());
        t.reset();
        assert_eq!(t.num(), 0);
        assert_eq!(t.delay(), None);
    }

    #[test]
    fn empty_delays_are_exhausted_immediately() {
        let mut t = RetryTimer::new((), vec![]);
        assert_eq!(t.next_at(0.0, true), None);
        assert_eq!(t.next_at(0.0, false), None);
    }
}
