// SPDX-License-Identifier: PMPL-1.0-or-later
//
// The state system: attribute tree + transient state + history backend.
//
// One builder thread feeds modifications while any number of reader threads
// query. Reads of the transient state happen before reads of the backend,
// and the builder writes the backend before updating the transient state,
// so a query never observes a gap between the two.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use regex::Regex;
use statehist_core::{Quark, StateInterval, StateValue, Timestamp, ValueType, ROOT_QUARK};
use statehist_tree::{HistoryBackend, HistoryTreeBackend, HtConfig};
use tracing::{info, trace, warn};

use crate::attribute::AttributeTree;
use crate::error::{StateSystemError, StateSystemResult};
use crate::range::RangeIter;
use crate::transient::TransientState;

/// Maximum depth of a stack attribute.
pub const MAX_STACK_DEPTH: i32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStatus {
    Building,
    Built,
    Cancelled,
}

/// A queryable, incrementally built state history.
pub struct StateSystem {
    backend: Arc<dyn HistoryBackend>,
    attributes: RwLock<AttributeTree>,
    transient: TransientState,
    status: Mutex<BuildStatus>,
    built: Condvar,
    disposed: AtomicBool,
}

impl StateSystem {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// A new, empty state system writing into `backend`.
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        let start = backend.start_time();
        info!(backend = backend.name(), start, "State system building");
        Self {
            backend,
            attributes: RwLock::new(AttributeTree::new()),
            transient: TransientState::new(start),
            status: Mutex::new(BuildStatus::Building),
            built: Condvar::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// A read-only state system over a sealed backend. The attribute tree is
    /// restored from the snapshot stored with the history.
    pub fn open_existing(backend: Arc<dyn HistoryBackend>) -> StateSystemResult<Self> {
        if !backend.is_sealed()? {
            return Err(StateSystemError::CorruptFile(format!(
                "{} history was never closed",
                backend.name()
            )));
        }
        let attributes = AttributeTree::decode(&backend.attribute_tree_bytes()?)?;
        let end = backend.end_time()?;
        info!(
            backend = backend.name(),
            start = backend.start_time(),
            end,
            attributes = attributes.len(),
            "State system opened"
        );
        Ok(Self {
            backend,
            attributes: RwLock::new(attributes),
            transient: TransientState::inactive(end),
            status: Mutex::new(BuildStatus::Built),
            built: Condvar::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Open the history file named by `config`, or start building a fresh
    /// one when it is missing, corrupt or written by another version.
    ///
    /// Check [`is_built`](Self::is_built) on the result to know whether the
    /// caller must feed events.
    pub fn open_or_build(config: HtConfig) -> StateSystemResult<Self> {
        if config.path.exists() {
            let opened = HistoryTreeBackend::open_existing(&config)
                .map_err(StateSystemError::from)
                .and_then(|backend| Self::open_existing(Arc::new(backend)));
            match opened {
                Ok(system) => return Ok(system),
                Err(e) if e.requires_rebuild() => {
                    warn!(path = %config.path.display(), error = %e, "Discarding unusable history file");
                    std::fs::remove_file(&config.path)
                        .map_err(|e| StateSystemError::Backend(e.into()))?;
                }
                Err(e) => return Err(e),
            }
        }
        let backend = HistoryTreeBackend::create(config)?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn backend(&self) -> &Arc<dyn HistoryBackend> {
        &self.backend
    }

    /// Seal the history at `end` (or the backend's end, if later).
    ///
    /// Every ongoing record is closed at the effective end, which is
    /// returned. Records that start after it are dropped.
    pub fn close_history(&self, end: Timestamp) -> StateSystemResult<Timestamp> {
        self.check_alive()?;
        let end = end.max(self.backend.end_time()?);
        self.transient.close(end, self.backend.as_ref())?;
        let (snapshot, count) = {
            let attrs = self.attrs()?;
            (attrs.encode(), attrs.len())
        };
        let end = self.backend.finished_building(end, &snapshot)?;
        self.set_status(BuildStatus::Built)?;
        info!(backend = self.backend.name(), end, attributes = count, "State history closed");
        Ok(end)
    }

    /// Block until the history is closed or the build is cancelled.
    /// Returns true if it was closed.
    pub fn wait_until_built(&self) -> StateSystemResult<bool> {
        let status = self.status.lock().map_err(|_| StateSystemError::LockPoisoned)?;
        let status = self
            .built
            .wait_while(status, |s| *s == BuildStatus::Building)
            .map_err(|_| StateSystemError::LockPoisoned)?;
        Ok(*status == BuildStatus::Built)
    }

    /// Like [`wait_until_built`](Self::wait_until_built) but gives up after
    /// `timeout`, returning false.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> StateSystemResult<bool> {
        let status = self.status.lock().map_err(|_| StateSystemError::LockPoisoned)?;
        let (status, _) = self
            .built
            .wait_timeout_while(status, timeout, |s| *s == BuildStatus::Building)
            .map_err(|_| StateSystemError::LockPoisoned)?;
        Ok(*status == BuildStatus::Built)
    }

    pub fn is_built(&self) -> StateSystemResult<bool> {
        Ok(self.current_status()? == BuildStatus::Built)
    }

    /// True if the system was disposed before its history was closed.
    pub fn is_cancelled(&self) -> StateSystemResult<bool> {
        Ok(self.current_status()? == BuildStatus::Cancelled)
    }

    /// Release the backend. An unfinished build is cancelled and its
    /// partial files removed. Later queries fail with `Disposed`.
    pub fn dispose(&self) -> StateSystemResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = {
            let mut status = self.status.lock().map_err(|_| StateSystemError::LockPoisoned)?;
            let building = *status == BuildStatus::Building;
            if building {
                *status = BuildStatus::Cancelled;
            }
            building
        };
        self.built.notify_all();
        self.transient.deactivate()?;
        if cancelled {
            info!(backend = self.backend.name(), "State system build cancelled");
            self.backend.remove_files()?;
        }
        self.backend.dispose()?;
        Ok(())
    }

    fn set_status(&self, next: BuildStatus) -> StateSystemResult<()> {
        *self.status.lock().map_err(|_| StateSystemError::LockPoisoned)? = next;
        self.built.notify_all();
        Ok(())
    }

    fn current_status(&self) -> StateSystemResult<BuildStatus> {
        Ok(*self.status.lock().map_err(|_| StateSystemError::LockPoisoned)?)
    }

    fn check_alive(&self) -> StateSystemResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StateSystemError::Disposed);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    fn attrs(&self) -> StateSystemResult<RwLockReadGuard<'_, AttributeTree>> {
        self.attributes.read().map_err(|_| StateSystemError::LockPoisoned)
    }

    fn attrs_mut(&self) -> StateSystemResult<RwLockWriteGuard<'_, AttributeTree>> {
        self.attributes.write().map_err(|_| StateSystemError::LockPoisoned)
    }

    fn check_quark(&self, quark: Quark) -> StateSystemResult<()> {
        if self.attrs()?.contains(quark) {
            Ok(())
        } else {
            Err(StateSystemError::not_found(quark))
        }
    }

    pub fn get_nb_attributes(&self) -> StateSystemResult<usize> {
        Ok(self.attrs()?.len())
    }

    pub fn get_quark_absolute(&self, path: &[&str]) -> StateSystemResult<Quark> {
        self.get_quark_relative(ROOT_QUARK, path)
    }

    pub fn opt_quark_absolute(&self, path: &[&str]) -> StateSystemResult<Option<Quark>> {
        self.opt_quark_relative(ROOT_QUARK, path)
    }

    pub fn get_quark_absolute_and_add(&self, path: &[&str]) -> StateSystemResult<Quark> {
        self.get_quark_relative_and_add(ROOT_QUARK, path)
    }

    pub fn get_quark_relative(&self, start: Quark, path: &[&str]) -> StateSystemResult<Quark> {
        self.opt_quark_relative(start, path)?
            .ok_or_else(|| StateSystemError::AttributeNotFound(path.join("/")))
    }

    pub fn opt_quark_relative(&self, start: Quark, path: &[&str]) -> StateSystemResult<Option<Quark>> {
        self.attrs()?.lookup(start, path)
    }

    /// Resolve `path` below `start`, creating missing attributes. New
    /// attributes hold null from the start of the history.
    pub fn get_quark_relative_and_add(&self, start: Quark, path: &[&str]) -> StateSystemResult<Quark> {
        if let Some(quark) = self.attrs()?.lookup(start, path)? {
            return Ok(quark);
        }
        let mut attrs = self.attrs_mut()?;
        if !self.transient.is_active()? {
            return Err(StateSystemError::Sealed);
        }
        let before = attrs.len();
        let quark = attrs.lookup_or_add(start, path)?;
        let added = attrs.len() - before;
        if added > 0 {
            self.transient.add_entries(added, self.backend.start_time())?;
            trace!(quark, added, "Attributes created");
        }
        Ok(quark)
    }

    pub fn get_sub_attributes(&self, quark: Quark, recursive: bool) -> StateSystemResult<Vec<Quark>> {
        self.attrs()?.sub_attributes(quark, recursive)
    }

    /// Sub-attributes whose name fully matches the regular expression
    /// `pattern`.
    pub fn get_sub_attributes_matching(
        &self,
        quark: Quark,
        recursive: bool,
        pattern: &str,
    ) -> StateSystemResult<Vec<Quark>> {
        let re = Regex::new(&format!("^(?:{pattern})$"))?;
        let attrs = self.attrs()?;
        let mut out = Vec::new();
        for q in attrs.sub_attributes(quark, recursive)? {
            if re.is_match(attrs.name(q)?) {
                out.push(q);
            }
        }
        Ok(out)
    }

    /// Quarks matching `pattern` from the top level. `*` expands to every
    /// child, `..` to the parent; any other element names a child.
    pub fn get_quarks(&self, pattern: &[&str]) -> StateSystemResult<Vec<Quark>> {
        self.get_quarks_relative(ROOT_QUARK, pattern)
    }

    pub fn get_quarks_relative(&self, start: Quark, pattern: &[&str]) -> StateSystemResult<Vec<Quark>> {
        let attrs = self.attrs()?;
        attrs.children(start)?;
        let mut current = vec![start];
        for element in pattern {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for &quark in &current {
                match *element {
                    "*" => next.extend(attrs.children(quark)?.iter().filter(|c| seen.insert(**c))),
                    ".." => {
                        if quark != ROOT_QUARK {
                            let parent = attrs.parent(quark)?;
                            if seen.insert(parent) {
                                next.push(parent);
                            }
                        }
                    }
                    name => {
                        if let Some(child) = attrs.child(quark, name)? {
                            if seen.insert(child) {
                                next.push(child);
                            }
                        }
                    }
                }
            }
            current = next;
        }
        current.retain(|q| *q != ROOT_QUARK);
        Ok(current)
    }

    pub fn get_attribute_name(&self, quark: Quark) -> StateSystemResult<String> {
        Ok(self.attrs()?.name(quark)?.to_string())
    }

    pub fn get_full_attribute_path(&self, quark: Quark) -> StateSystemResult<String> {
        self.attrs()?.full_path(quark)
    }

    pub fn get_full_attribute_path_array(&self, quark: Quark) -> StateSystemResult<Vec<String>> {
        self.attrs()?.full_path_array(quark)
    }

    /// Parent of `quark`; `ROOT_QUARK` for top-level attributes.
    pub fn get_parent_attribute_quark(&self, quark: Quark) -> StateSystemResult<Quark> {
        self.attrs()?.parent(quark)
    }

    /// Snapshot of the attribute tree.
    pub fn attribute_tree(&self) -> StateSystemResult<AttributeTree> {
        Ok(self.attrs()?.clone())
    }

    // -----------------------------------------------------------------------
    // Modification
    // -----------------------------------------------------------------------

    /// Set `quark` to `value` from time `t` on.
    pub fn modify_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> StateSystemResult<()> {
        self.check_alive()?;
        self.transient
            .process_state_change(t, value, quark, self.backend.as_ref())
    }

    /// Push `value` on the stack attribute `quark`.
    ///
    /// The stack quark holds the depth as an `Int`; the entries are its
    /// children named `"1"`, `"2"`, and so on.
    pub fn push_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> StateSystemResult<()> {
        let depth = match self.query_ongoing_state(quark)? {
            StateValue::Null => 0,
            StateValue::Int(depth) => depth,
            other => {
                return Err(StateSystemError::StateValueType {
                    quark,
                    expected: ValueType::Int,
                    found: other.value_type(),
                })
            }
        };
        if depth >= MAX_STACK_DEPTH {
            return Err(StateSystemError::StackOverflow {
                quark,
                limit: MAX_STACK_DEPTH,
            });
        }
        let depth = depth + 1;
        let name = depth.to_string();
        let entry = self.get_quark_relative_and_add(quark, &[name.as_str()])?;
        self.modify_attribute(t, StateValue::Int(depth), quark)?;
        self.modify_attribute(t, value, entry)
    }

    /// Pop the top of the stack attribute `quark`, returning it. Popping an
    /// empty stack returns `None`.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> StateSystemResult<Option<StateValue>> {
        let depth = match self.query_ongoing_state(quark)? {
            StateValue::Null => return Ok(None),
            StateValue::Int(depth) if depth > 0 => depth,
            StateValue::Int(depth) => {
                return Err(StateSystemError::AttributeNotFound(format!(
                    "stack attribute {quark} has depth {depth}"
                )))
            }
            other => {
                return Err(StateSystemError::StateValueType {
                    quark,
                    expected: ValueType::Int,
                    found: other.value_type(),
                })
            }
        };
        let name = depth.to_string();
        let entry = self.get_quark_relative(quark, &[name.as_str()])?;
        let popped = self.query_ongoing_state(entry)?;
        let next = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, next, quark)?;
        self.remove_attribute(t, entry)?;
        Ok(Some(popped))
    }

    /// Null `quark` and every attribute below it at time `t`.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> StateSystemResult<()> {
        let subtree = self.get_sub_attributes(quark, true)?;
        for q in subtree.into_iter().rev().chain(std::iter::once(quark)) {
            self.modify_attribute(t, StateValue::Null, q)?;
        }
        Ok(())
    }

    /// Replace the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> StateSystemResult<()> {
        self.check_alive()?;
        self.transient.change_ongoing_value(quark, value)
    }

    pub fn query_ongoing_state(&self, quark: Quark) -> StateSystemResult<StateValue> {
        self.check_alive()?;
        self.transient.ongoing_value(quark)
    }

    pub fn get_ongoing_start_time(&self, quark: Quark) -> StateSystemResult<Timestamp> {
        self.check_alive()?;
        self.transient.ongoing_start(quark)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    /// Latest timestamp known: the sealed end, or while building the later
    /// of the backend end and the last modification.
    pub fn get_current_end_time(&self) -> StateSystemResult<Timestamp> {
        Ok(self.backend.end_time()?.max(self.transient.latest_time()?))
    }

    fn check_time(&self, t: Timestamp) -> StateSystemResult<()> {
        let start = self.backend.start_time();
        if t < start {
            return Err(StateSystemError::TimeRange {
                time: t,
                start,
                end: self.get_current_end_time()?,
            });
        }
        if !self.transient.is_active()? {
            let end = self.backend.end_time()?;
            if t > end {
                return Err(StateSystemError::TimeRange { time: t, start, end });
            }
        }
        Ok(())
    }

    fn missing(quark: Quark, t: Timestamp) -> StateSystemError {
        StateSystemError::CorruptFile(format!("no interval for quark {quark} at {t}"))
    }

    /// The interval of `quark` covering `t`, and whether it is the ongoing
    /// one.
    pub(crate) fn lookup(&self, t: Timestamp, quark: Quark) -> StateSystemResult<(StateInterval, bool)> {
        self.check_alive()?;
        self.check_quark(quark)?;
        self.check_time(t)?;
        if let Some(iv) = self.transient.interval_at(t, quark)? {
            return Ok((iv, true));
        }
        let iv = self
            .backend
            .do_single_query(t, quark)?
            .ok_or_else(|| Self::missing(quark, t))?;
        Ok((iv, false))
    }

    /// The interval of `quark` covering `t`.
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> StateSystemResult<StateInterval> {
        trace!(t, quark, "Single state query");
        Ok(self.lookup(t, quark)?.0)
    }

    /// One interval per quark, indexed by quark, covering `t`.
    pub fn query_full_state(&self, t: Timestamp) -> StateSystemResult<Vec<StateInterval>> {
        self.check_alive()?;
        self.check_time(t)?;
        let count = self.get_nb_attributes()?;
        let mut out = vec![None; count];
        self.transient.fill(&mut out, t)?;
        if out.iter().any(Option::is_none) {
            self.backend.do_query(&mut out, t)?;
        }
        trace!(t, count, "Full state query");
        out.into_iter()
            .enumerate()
            .map(|(q, slot)| slot.ok_or_else(|| Self::missing(q as Quark, t)))
            .collect()
    }

    /// Lazily iterate the intervals of `quark` from the one covering `t1`
    /// through the one covering `t2`.
    ///
    /// On a sealed history `t2` is clamped to the end of the history.
    pub fn query_range(&self, quark: Quark, t1: Timestamp, t2: Timestamp) -> StateSystemResult<RangeIter<'_>> {
        self.check_alive()?;
        self.check_quark(quark)?;
        let t2 = if self.transient.is_active()? {
            t2
        } else {
            t2.min(self.get_current_end_time()?)
        };
        if t1 > t2 {
            return Err(StateSystemError::TimeRange {
                time: t1,
                start: self.get_start_time(),
                end: t2,
            });
        }
        Ok(RangeIter::new(self, quark, t1, t2))
    }

    /// Every interval of `quarks` intersecting `[t1, t2]`, ongoing ones
    /// included, in no particular order.
    pub fn query_2d(&self, quarks: &[Quark], t1: Timestamp, t2: Timestamp) -> StateSystemResult<Vec<StateInterval>> {
        self.check_alive()?;
        if t1 > t2 {
            return Err(StateSystemError::TimeRange {
                time: t1,
                start: self.get_start_time(),
                end: t2,
            });
        }
        for &quark in quarks {
            self.check_quark(quark)?;
        }
        let wanted: HashSet<Quark> = quarks.iter().copied().collect();
        let ongoing = self.transient.intervals_until(wanted.iter().copied(), t2)?;
        let stored = self.backend.query_2d(&wanted, t1, t2)?;

        let open: HashSet<(Quark, Timestamp)> = ongoing.iter().map(|iv| (iv.quark, iv.start)).collect();
        let mut out: Vec<StateInterval> = stored
            .into_iter()
            .filter(|iv| !open.contains(&(iv.quark, iv.start)))
            .collect();
        out.extend(ongoing.into_iter().filter(|iv| iv.intersects(t1, t2)));
        trace!(t1, t2, quarks = wanted.len(), found = out.len(), "2D query");
        Ok(out)
    }
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("backend", &self.backend.name())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
