//! Bounded poll-and-retry for transitions a human must confirm on the device.
//!
//! Unlocking or relocking a bootloader shows a prompt on the phone that only
//! the volume and power keys can answer. [`Confirmation::run`] re-issues the
//! request at a fixed interval and polls a device variable until it reports the
//! expected value, giving up after a fixed number of polls.
use std::time::Duration;

/// Blocks the calling thread. Abstracted so tests never really sleep.
pub trait Sleeper: Sync {
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`std::thread::sleep`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Parameters of one confirmation loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub variable: String,
    pub expected: String,
    /// Total number of polls, including the initial one. Treated as at least 1.
    pub max_attempts: u32,
    pub interval: Duration,
}

/// How a successful confirmation came about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmed {
    /// The variable already held the expected value; the action never ran.
    AlreadySatisfied,
    /// The variable matched on poll number `polls`, after the action was
    /// issued `actions` times (always 0 for [`Confirmation::wait`]).
    AfterPolls { polls: u32, actions: u32 },
}

/// The variable never reached the expected value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unconfirmed {
    pub polls: u32,
    pub last_seen: Option<String>,
}

impl Confirmation {
    pub fn new(
        variable: impl Into<String>,
        expected: impl Into<String>,
        max_attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            variable: variable.into(),
            expected: expected.into(),
            max_attempts,
            interval,
        }
    }

    /// Drives the loop.
    ///
    /// 1. Poll. If the value already matches, return without acting.
    /// 2. Issue `action`, sleep `interval`, poll again.
    /// 3. Repeat 2 until a poll matches or `max_attempts` polls have been made.
    ///
    /// `action` is fire-and-forget: it usually only triggers the on-device
    /// prompt, and its own result is not a signal of success.
    pub fn run<A, P>(
        &self,
        mut action: A,
        poll: P,
        sleeper: &dyn Sleeper,
    ) -> Result<Confirmed, Unconfirmed>
    where
        A: FnMut(),
        P: FnMut(&str) -> Option<String>,
    {
        let action: &mut dyn FnMut() = &mut action;
        self.drive(Some(action), poll, sleeper)
    }

    /// Polls without ever issuing an action, for states the operator reaches
    /// through an on-device menu (e.g. "Apply update from ADB").
    pub fn wait<P>(&self, poll: P, sleeper: &dyn Sleeper) -> Result<Confirmed, Unconfirmed>
    where
        P: FnMut(&str) -> Option<String>,
    {
        self.drive(None, poll, sleeper)
    }

    fn drive<P>(
        &self,
        mut action: Option<&mut dyn FnMut()>,
        mut poll: P,
        sleeper: &dyn Sleeper,
    ) -> Result<Confirmed, Unconfirmed>
    where
        P: FnMut(&str) -> Option<String>,
    {
        let max_attempts = self.max_attempts.max(1);

        let mut last_seen = poll(&self.variable);
        let mut polls = 1;
        if self.matches(&last_seen) {
            return Ok(Confirmed::AlreadySatisfied);
        }

        let mut actions = 0;
        while polls < max_attempts {
            if let Some(action) = action.as_deref_mut() {
                action();
                actions += 1;
            }
            sleeper.sleep(self.interval);

            last_seen = poll(&self.variable);
            polls += 1;
            if self.matches(&last_seen) {
                return Ok(Confirmed::AfterPolls { polls, actions });
            }
        }

        Err(Unconfirmed { polls, last_seen })
    }

    fn matches(&self, value: &Option<String>) -> bool {
        value.as_deref() == Some(self.expected.as_str())
    }
}
