//! VESA communication error recovery
//!
//! A host that gets no valid reply waits at least 40ms and sends the request
//! again. [`RetryPolicy`] only decides *when* to try again, whatever happens
//! in between is reported to a [`RetryObserver`].

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{resolver::DisplayHandle, DdcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RetryPolicy {
    /// total number of attempts including the first one
    pub max_attempts: u32,
    /// pause before every attempt after the first
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::VESA
    }
}

impl RetryPolicy {
    pub const VESA: Self = Self {
        max_attempts: 10,
        delay: Duration::from_millis(40),
    };

    /// no retries at all
    pub const ONCE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    /// pause before the attempt with the zero based index `attempt`
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        (attempt > 0).then_some(self.delay)
    }

    pub fn should_retry(&self, attempts_made: u32, error: &DdcError) -> bool {
        error.is_transient() && attempts_made < self.max_attempts
    }

    /// drive `attempt` until it succeeds, fails permanently or runs out of attempts
    ///
    /// `delay` performs the pause between attempts and `on_failure` sees every
    /// failed attempt with its one based number.
    pub fn run<T, D, F, A>(&self, mut delay: D, mut on_failure: F, mut attempt: A) -> Result<T, DdcError>
    where
        D: FnMut(Duration),
        F: FnMut(u32, &DdcError),
        A: FnMut(u32) -> Result<T, DdcError>,
    {
        let mut attempts_made = 0;
        loop {
            if let Some(pause) = self.delay_before(attempts_made) {
                delay(pause);
            }
            let error = match attempt(attempts_made) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempts_made += 1;
            on_failure(attempts_made, &error);
            if !self.should_retry(attempts_made, &error) {
                return Err(if error.is_transient() {
                    DdcError::RetriesExhausted {
                        attempts: attempts_made,
                        last: Box::new(error),
                    }
                } else {
                    error
                });
            }
        }
    }
}

/// Receives diagnostics from the controller.
pub trait RetryObserver: Send + Sync {
    fn attempt_failed(&self, _display: DisplayHandle, _attempt: u32, _error: &DdcError) {}

    /// a control read gave up and reports a zero result
    fn read_failed(&self, _display: DisplayHandle, _control_id: u8, _error: &DdcError) {}
}

/// Default observer, forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RetryObserver for LogObserver {
    fn attempt_failed(&self, display: DisplayHandle, attempt: u32, error: &DdcError) {
        log::debug!("{display}: attempt {attempt} failed: {error}");
    }

    fn read_failed(&self, display: DisplayHandle, control_id: u8, error: &DdcError) {
        match error.root() {
            DdcError::EndpointNotFound => {
                log::debug!("{display}: vcp {control_id:#04x} not read, display has no DDC/CI bus")
            }
            DdcError::UnsupportedFraming | DdcError::Transport(super::TransportError::UnsupportedFraming) => {
                log::warn!("{display}: vcp {control_id:#04x} not read, unsupported transaction type")
            }
            DdcError::Transport(_) => {
                log::warn!("{display}: vcp {control_id:#04x} not read, no reply: {error}")
            }
            DdcError::Protocol(_) => {
                log::warn!("{display}: vcp {control_id:#04x} not read, corrupt reply: {error}")
            }
            _ => log::warn!("{display}: vcp {control_id:#04x} not read: {error}"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, time::Duration};

    use super::RetryPolicy;
    use crate::ddc::{ci::DdcCiProtocolError, DdcError, TransportError};

    #[test]
    fn no_delay_before_first_attempt() {
        let policy = RetryPolicy::VESA;
        assert_eq!(policy.delay_before(0), None);
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(40)));
        assert_eq!(policy.delay_before(9), Some(Duration::from_millis(40)));
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let delays = RefCell::new(Vec::new());
        let mut failures = Vec::new();
        let mut attempts = 0;
        let result: Result<(), _> = RetryPolicy::VESA.run(
            |pause| delays.borrow_mut().push(pause),
            |n, _| failures.push(n),
            |_| {
                attempts += 1;
                Err(TransportError::NoDevice.into())
            },
        );
        assert_eq!(attempts, 10);
        assert_eq!(delays.borrow().len(), 9);
        assert_eq!(failures, (1..=10).collect::<Vec<_>>());
        assert!(matches!(
            result,
            Err(DdcError::RetriesExhausted { attempts: 10, .. })
        ));
    }

    #[test]
    fn stops_on_first_success() {
        let mut delays = 0;
        let result = RetryPolicy::VESA.run(
            |_| delays += 1,
            |_, _| {},
            |attempt| {
                if attempt < 3 {
                    Err(DdcCiProtocolError::InvalidChecksum.into())
                } else {
                    Ok(attempt)
                }
            },
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(delays, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), _> = RetryPolicy::VESA.run(
            |_| {},
            |_, _| {},
            |_| {
                attempts += 1;
                Err(DdcError::UnsupportedFraming)
            },
        );
        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(DdcError::UnsupportedFraming)));
    }

    #[test]
    fn single_attempt_policy() {
        let mut attempts = 0;
        let result: Result<(), _> = RetryPolicy::ONCE.run(
            |_| panic!("no delay expected"),
            |_, _| {},
            |_| {
                attempts += 1;
                Err(TransportError::NoDevice.into())
            },
        );
        assert_eq!(attempts, 1);
        assert!(matches!(
            result,
            Err(DdcError::RetriesExhausted { attempts: 1, .. })
        ));
    }
}
