use chrono::{Local, NaiveDate, NaiveDateTime};
#[cfg(test)]
use std::sync::Mutex;

/// Source of local wall-clock time. Dates, the cutoff hour and the
/// next-session timestamp are all local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock for tests.
#[cfg(test)]
#[derive(Debug)]
pub struct FixedClock(Mutex<NaiveDateTime>);

#[cfg(test)]
impl FixedClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: NaiveDateTime) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = at;
        }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
