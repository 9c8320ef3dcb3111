// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Transient state: the ongoing (not yet closed) interval of every quark.
//
// The builder changes a quark's value here; the previous value is closed
// into an interval and handed to the backend *before* the ongoing record is
// updated, so a reader that sees the new ongoing start is guaranteed to find
// the older interval in the backend.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use statehist_core::{Quark, StateInterval, StateValue, Timestamp, ValueType};
use statehist_tree::HistoryBackend;
use tracing::debug;

use crate::error::{StateSystemError, StateSystemResult};

#[derive(Debug, Clone)]
struct Ongoing {
    value: StateValue,
    start: Timestamp,
    /// Type of the first non-null value written, if any.
    value_type: Option<ValueType>,
}

#[derive(Debug)]
struct Inner {
    ongoing: Vec<Ongoing>,
    latest_time: Timestamp,
    active: bool,
}

impl Inner {
    fn get(&self, quark: Quark) -> StateSystemResult<&Ongoing> {
        if !self.active {
            return Err(StateSystemError::Sealed);
        }
        self.ongoing
            .get(quark as usize)
            .ok_or_else(|| StateSystemError::not_found(quark))
    }

    fn get_mut(&mut self, quark: Quark) -> StateSystemResult<&mut Ongoing> {
        if !self.active {
            return Err(StateSystemError::Sealed);
        }
        self.ongoing
            .get_mut(quark as usize)
            .ok_or_else(|| StateSystemError::not_found(quark))
    }
}

/// Ongoing records for every quark of a state system under construction.
#[derive(Debug)]
pub struct TransientState {
    inner: RwLock<Inner>,
}

impl TransientState {
    /// An active transient state starting at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ongoing: Vec::new(),
                latest_time: start,
                active: true,
            }),
        }
    }

    /// A transient state for a history that is already sealed.
    pub fn inactive(end: Timestamp) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ongoing: Vec::new(),
                latest_time: end,
                active: false,
            }),
        }
    }

    fn read(&self) -> StateSystemResult<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| StateSystemError::LockPoisoned)
    }

    fn write(&self) -> StateSystemResult<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| StateSystemError::LockPoisoned)
    }

    pub fn is_active(&self) -> StateSystemResult<bool> {
        Ok(self.read()?.active)
    }

    /// Latest timestamp at which a value changed.
    pub fn latest_time(&self) -> StateSystemResult<Timestamp> {
        Ok(self.read()?.latest_time)
    }

    /// Register `count` new quarks, each holding null from `start`.
    pub fn add_entries(&self, count: usize, start: Timestamp) -> StateSystemResult<()> {
        let mut inner = self.write()?;
        if !inner.active {
            return Ok(());
        }
        let len = inner.ongoing.len() + count;
        inner.ongoing.resize(
            len,
            Ongoing {
                value: StateValue::Null,
                start,
                value_type: None,
            },
        );
        Ok(())
    }

    pub fn ongoing_value(&self, quark: Quark) -> StateSystemResult<StateValue> {
        Ok(self.read()?.get(quark)?.value.clone())
    }

    pub fn ongoing_start(&self, quark: Quark) -> StateSystemResult<Timestamp> {
        Ok(self.read()?.get(quark)?.start)
    }

    /// Overwrite the ongoing value without closing an interval.
    pub fn change_ongoing_value(&self, quark: Quark, value: StateValue) -> StateSystemResult<()> {
        self.write()?.get_mut(quark)?.value = value;
        Ok(())
    }

    /// The ongoing interval of `quark` if it covers `t`.
    ///
    /// The interval runs to `max(latest_time, t)`: nothing after the latest
    /// change is known yet, so the value is assumed to still hold.
    pub fn interval_at(&self, t: Timestamp, quark: Quark) -> StateSystemResult<Option<StateInterval>> {
        let inner = self.read()?;
        if !inner.active {
            return Ok(None);
        }
        let rec = inner.get(quark)?;
        if t < rec.start {
            return Ok(None);
        }
        Ok(Some(StateInterval::new(
            rec.start,
            inner.latest_time.max(t),
            quark,
            rec.value.clone(),
        )))
    }

    /// Fill every empty slot of `out` whose ongoing interval covers `t`.
    pub fn fill(&self, out: &mut [Option<StateInterval>], t: Timestamp) -> StateSystemResult<()> {
        let inner = self.read()?;
        if !inner.active {
            return Ok(());
        }
        let end = inner.latest_time.max(t);
        for (quark, (slot, rec)) in out.iter_mut().zip(&inner.ongoing).enumerate() {
            if slot.is_none() && rec.start <= t {
                *slot = Some(StateInterval::new(rec.start, end, quark as Quark, rec.value.clone()));
            }
        }
        Ok(())
    }

    /// Ongoing intervals of `quarks` starting at or before `t2`, ending at
    /// `max(latest_time, t2)`.
    pub fn intervals_until(
        &self,
        quarks: impl IntoIterator<Item = Quark>,
        t2: Timestamp,
    ) -> StateSystemResult<Vec<StateInterval>> {
        let inner = self.read()?;
        if !inner.active {
            return Ok(Vec::new());
        }
        let end = inner.latest_time.max(t2);
        let mut out = Vec::new();
        for quark in quarks {
            let rec = inner.get(quark)?;
            if rec.start <= t2 {
                out.push(StateInterval::new(rec.start, end, quark, rec.value.clone()));
            }
        }
        Ok(out)
    }

    /// Set `quark` to `value` at time `t`, closing the previous value into
    /// `backend` when the value actually changes.
    pub fn process_state_change(
        &self,
        t: Timestamp,
        value: StateValue,
        quark: Quark,
        backend: &dyn HistoryBackend,
    ) -> StateSystemResult<()> {
        let mut inner = self.write()?;
        let rec = inner.get(quark)?;

        let found = value.value_type();
        if let Some(expected) = rec.value_type {
            if found != ValueType::Null && found != expected {
                return Err(StateSystemError::StateValueType {
                    quark,
                    expected,
                    found,
                });
            }
        }
        if t < rec.start {
            return Err(StateSystemError::TimeRange {
                time: t,
                start: rec.start,
                end: Timestamp::MAX,
            });
        }
        if rec.value == value {
            return Ok(());
        }

        if rec.start < t {
            backend.insert_past_state(rec.start, t - 1, quark, rec.value.clone())?;
        }
        let rec = inner.get_mut(quark)?;
        rec.start = t;
        if found != ValueType::Null {
            rec.value_type = Some(found);
        }
        rec.value = value;
        if inner.latest_time < t {
            inner.latest_time = t;
        }
        Ok(())
    }

    /// Close every ongoing record at `end` and deactivate.
    ///
    /// Records that started after `end` are dropped.
    pub fn close(&self, end: Timestamp, backend: &dyn HistoryBackend) -> StateSystemResult<()> {
        let mut inner = self.write()?;
        if !inner.active {
            return Err(StateSystemError::Sealed);
        }
        let mut dropped = 0usize;
        for (quark, rec) in inner.ongoing.iter().enumerate() {
            if rec.start > end {
                dropped += 1;
                continue;
            }
            backend.insert_past_state(rec.start, end, quark as Quark, rec.value.clone())?;
        }
        if dropped > 0 {
            debug!(end, dropped, "Dropped ongoing records starting after history end");
        }
        inner.ongoing = Vec::new();
        inner.latest_time = inner.latest_time.max(end);
        inner.active = false;
        Ok(())
    }

    /// Stop accepting changes without closing anything.
    pub fn deactivate(&self) -> StateSystemResult<()> {
        let mut inner = self.write()?;
        inner.active = false;
        inner.ongoing = Vec::new();
        Ok(())
    }
}
