//! Per-partition window state. The operator registers the windows of every element, folds the
//! element into its pane and, when the timer of the partition fires, assembles every window which
//! became due and releases the panes it was holding.
//!
//! A window moves through `Pending -> Fired -> Discarded` exactly once. Once a deadline has been
//! processed, windows ending at or before it are never registered again. An element stamped before
//! that deadline, because its send raced the timer or the clock stepped back, is moved forward to
//! the deadline and lands in the open pane instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::function::{AccumulationMode, WindowFunction};
use crate::message::WindowResult;
use crate::metrics::{Labels, partition_labels, window_metrics};
use crate::pane::PaneAccumulator;
use crate::windower::{Window, WindowAssigner, utc_from_millis};

/// Window state of a single key.
struct KeyedState<F: WindowFunction> {
    panes: PaneAccumulator<F>,
    pending: BTreeSet<Window>,
}

pub struct WindowOperator<F: WindowFunction> {
    assigner: WindowAssigner,
    function: Arc<F>,
    mode: AccumulationMode,
    keys: HashMap<String, KeyedState<F>>,
    /// Keys with a pending window, indexed by the window end in millis.
    pending: BTreeMap<i64, BTreeSet<String>>,
    pending_count: usize,
    /// Latest deadline processed by [Self::on_timer].
    last_fired: Option<i64>,
    partition: u16,
    labels: Labels,
}

impl<F: WindowFunction> WindowOperator<F> {
    pub fn new(
        assigner: WindowAssigner,
        function: Arc<F>,
        mode: AccumulationMode,
        partition: u16,
    ) -> Self {
        Self {
            assigner,
            function,
            mode,
            keys: HashMap::new(),
            pending: BTreeMap::new(),
            pending_count: 0,
            last_fired: None,
            partition,
            labels: partition_labels(partition),
        }
    }

    /// Folds the element into the pane of `timestamp` and registers its windows which are not
    /// pending yet. A timestamp before the last processed deadline is moved to that deadline.
    /// Returns the windows the element contributes to, empty only for a timestamp before the epoch.
    pub fn on_element(
        &mut self,
        key: &str,
        value: F::Input,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Window>> {
        let last_fired = self.last_fired;
        let timestamp = match last_fired {
            Some(last) if timestamp.timestamp_millis() < last => {
                debug!(
                    partition = self.partition,
                    key,
                    timestamp = timestamp.timestamp_millis(),
                    last_fired = last,
                    "Element stamped before the last deadline, moving it to the open pane"
                );
                window_metrics()
                    .late_reassigned_total
                    .get_or_create(&self.labels)
                    .inc();
                utc_from_millis(last)
            }
            _ => timestamp,
        };

        let windows: Vec<Window> = self
            .assigner
            .assign_windows(timestamp)
            .into_iter()
            .filter(|window| last_fired.is_none_or(|last| window.end_millis() > last))
            .collect();

        if windows.is_empty() {
            debug!(
                partition = self.partition,
                key,
                timestamp = timestamp.timestamp_millis(),
                "Dropping element stamped before the epoch, it has no window"
            );
            window_metrics()
                .dropped_total
                .get_or_create(&self.labels)
                .inc();
            return Ok(windows);
        }

        let function = &self.function;
        let mode = self.mode;
        let state = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyedState {
                panes: PaneAccumulator::new(Arc::clone(function), mode),
                pending: BTreeSet::new(),
            });

        for window in &windows {
            if !state.pending.insert(*window) {
                continue;
            }
            for pane in self.assigner.panes_of(window) {
                state.panes.retain(pane);
            }
            self.pending
                .entry(window.end_millis())
                .or_default()
                .insert(key.to_string());
            self.pending_count += 1;
            debug!(partition = self.partition, key, %window, "Registered window");
        }

        state
            .panes
            .fold_into(self.assigner.pane_for(timestamp), value)?;

        let metrics = window_metrics();
        metrics.elements_total.get_or_create(&self.labels).inc();
        metrics
            .pending_windows
            .get_or_create(&self.labels)
            .set(self.pending_count as i64);

        Ok(windows)
    }

    /// Fires every pending window ending at or before `deadline`, ordered by window end and then by
    /// key. The panes of a fired window are released and evicted once no pending window needs them.
    pub fn on_timer(&mut self, deadline: DateTime<Utc>) -> Result<Vec<WindowResult<F::Output>>> {
        let deadline_millis = deadline.timestamp_millis();
        let not_due = self.pending.split_off(&deadline_millis.saturating_add(1));
        let due = std::mem::replace(&mut self.pending, not_due);

        let mut results = Vec::new();
        let mut evicted = 0u64;

        for (end_millis, keys) in due {
            let window = self.assigner.window_ending_at(end_millis);
            for key in keys {
                let Some(state) = self.keys.get_mut(&key) else {
                    warn!(
                        partition = self.partition,
                        %key,
                        %window,
                        "No state found for pending window"
                    );
                    continue;
                };

                let value = state.panes.assemble(&window)?;
                state.pending.remove(&window);
                self.pending_count = self.pending_count.saturating_sub(1);
                for pane in self.assigner.panes_of(&window) {
                    if state.panes.release(pane) {
                        evicted += 1;
                    }
                }

                if state.pending.is_empty() {
                    self.keys.remove(&key);
                }

                debug!(partition = self.partition, %key, %window, "Fired window");
                results.push(WindowResult { key, window, value });
            }
        }

        self.last_fired = Some(
            self.last_fired
                .map_or(deadline_millis, |last| last.max(deadline_millis)),
        );

        let metrics = window_metrics();
        metrics
            .windows_fired_total
            .get_or_create(&self.labels)
            .inc_by(results.len() as u64);
        metrics
            .panes_evicted_total
            .get_or_create(&self.labels)
            .inc_by(evicted);
        metrics
            .pending_windows
            .get_or_create(&self.labels)
            .set(self.pending_count as i64);

        Ok(results)
    }

    /// Drops every pending window and pane without firing. Returns the number of discarded windows.
    pub fn discard(&mut self) -> usize {
        let discarded = self.pending_count;
        self.keys.clear();
        self.pending.clear();
        self.pending_count = 0;
        window_metrics()
            .pending_windows
            .get_or_create(&self.labels)
            .set(0);
        discarded
    }

    /// Number of pending windows across all keys.
    pub fn pending_windows(&self) -> usize {
        self.pending_count
    }

    /// Number of live panes across all keys.
    pub fn pane_count(&self) -> usize {
        self.keys.values().map(|state| state.panes.len()).sum()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired.map(utc_from_millis)
    }

    pub fn assigner(&self) -> &WindowAssigner {
        &self.assigner
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::error::Error;
    use crate::function::Sum;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn fired(results: &[WindowResult<i64>]) -> Vec<(String, i64, i64, i64)> {
        results
            .iter()
            .map(|r| {
                (
                    r.key.clone(),
                    r.window.start_millis(),
                    r.window.end_millis(),
                    r.value,
                )
            })
            .collect()
    }

    fn sliding_operator(mode: AccumulationMode) -> WindowOperator<Sum> {
        let assigner =
            WindowAssigner::sliding(Duration::from_millis(10), Duration::from_millis(5)).unwrap();
        WindowOperator::new(assigner, Arc::new(Sum), mode, 0)
    }

    #[test]
    fn test_sliding_scenario() {
        for mode in [AccumulationMode::Aggregating, AccumulationMode::Accumulating] {
            let mut operator = sliding_operator(mode);

            let windows = operator.on_element("k", 1, ts(2)).unwrap();
            assert_eq!(windows, vec![Window::new(ts(0), ts(10))]);
            assert!(operator.on_timer(ts(5)).unwrap().is_empty());

            operator.on_element("k", 1, ts(6)).unwrap();
            operator.on_element("k", 1, ts(9)).unwrap();
            assert_eq!(operator.pending_windows(), 2);

            let results = operator.on_timer(ts(10)).unwrap();
            assert_eq!(fired(&results), vec![("k".to_string(), 0, 10, 3)]);

            operator.on_element("k", 1, ts(12)).unwrap();
            let results = operator.on_timer(ts(15)).unwrap();
            assert_eq!(fired(&results), vec![("k".to_string(), 5, 15, 3)]);

            let results = operator.on_timer(ts(20)).unwrap();
            assert_eq!(fired(&results), vec![("k".to_string(), 10, 20, 1)]);

            assert_eq!(operator.pending_windows(), 0);
            assert_eq!(operator.pane_count(), 0);
            assert_eq!(operator.key_count(), 0);
        }
    }

    #[test]
    fn test_overdue_windows_fire_together() {
        let mut operator = sliding_operator(AccumulationMode::Aggregating);
        for t in [2, 6, 12] {
            operator.on_element("k", 1, ts(t)).unwrap();
        }

        // a single late wake-up closes everything that became due
        let results = operator.on_timer(ts(20)).unwrap();
        assert_eq!(
            fired(&results),
            vec![
                ("k".to_string(), 0, 10, 2),
                ("k".to_string(), 5, 15, 2),
                ("k".to_string(), 10, 20, 1),
            ]
        );
        assert_eq!(operator.pane_count(), 0);
        assert_eq!(operator.last_fired(), Some(ts(20)));
    }

    #[test]
    fn test_late_elements() {
        let assigner = WindowAssigner::tumbling(Duration::from_millis(10)).unwrap();
        let mut operator =
            WindowOperator::new(assigner, Arc::new(Sum), AccumulationMode::default(), 0);
        operator.on_element("k", 1, ts(3)).unwrap();
        operator.on_timer(ts(10)).unwrap();

        // [0, 10) has fired, the element goes to the open window instead
        let windows = operator.on_element("k", 5, ts(9)).unwrap();
        assert_eq!(windows, vec![Window::new(ts(10), ts(20))]);
        assert_eq!(operator.pending_windows(), 1);
        let results = operator.on_timer(ts(20)).unwrap();
        assert_eq!(fired(&results), vec![("k".to_string(), 10, 20, 5)]);

        // a sliding element is moved to the deadline, so it joins every window open at that time
        let mut operator = sliding_operator(AccumulationMode::Aggregating);
        operator.on_element("k", 1, ts(2)).unwrap();
        operator.on_timer(ts(10)).unwrap();
        let windows = operator.on_element("k", 4, ts(8)).unwrap();
        assert_eq!(
            windows,
            vec![Window::new(ts(5), ts(15)), Window::new(ts(10), ts(20))]
        );
        let results = operator.on_timer(ts(20)).unwrap();
        assert_eq!(
            fired(&results),
            vec![("k".to_string(), 5, 15, 4), ("k".to_string(), 10, 20, 4)]
        );
        assert_eq!(operator.pane_count(), 0);
    }

    #[test]
    fn test_elements_before_the_epoch_are_dropped() {
        let mut operator = sliding_operator(AccumulationMode::Aggregating);
        assert!(operator.on_element("k", 1, ts(-3)).unwrap().is_empty());
        assert_eq!(operator.key_count(), 0);
        assert_eq!(operator.pane_count(), 0);
    }

    #[test]
    fn test_keys_are_isolated() {
        let mut operator = sliding_operator(AccumulationMode::Aggregating);
        operator.on_element("b", 10, ts(1)).unwrap();
        operator.on_element("a", 1, ts(2)).unwrap();
        operator.on_element("a", 2, ts(7)).unwrap();
        assert_eq!(operator.key_count(), 2);

        let results = operator.on_timer(ts(10)).unwrap();
        assert_eq!(
            fired(&results),
            vec![("a".to_string(), 0, 10, 3), ("b".to_string(), 0, 10, 10)]
        );
        // "b" has nothing pending anymore
        assert_eq!(operator.key_count(), 1);

        let results = operator.on_timer(ts(15)).unwrap();
        assert_eq!(fired(&results), vec![("a".to_string(), 5, 15, 2)]);
    }

    #[test]
    fn test_modes_agree_on_extreme_values() {
        for mode in [AccumulationMode::Aggregating, AccumulationMode::Accumulating] {
            // the running sum leaves the i64 range and comes back within the window
            let mut operator = sliding_operator(mode);
            operator.on_element("k", 1, ts(1)).unwrap();
            operator.on_element("k", i64::MAX, ts(6)).unwrap();
            operator.on_element("k", -1, ts(7)).unwrap();
            let results = operator.on_timer(ts(10)).unwrap();
            assert_eq!(fired(&results), vec![("k".to_string(), 0, 10, i64::MAX)]);

            // a window total outside the i64 range fails when the window fires
            let mut operator = sliding_operator(mode);
            operator.on_element("k", i64::MAX, ts(1)).unwrap();
            operator.on_element("k", 1, ts(2)).unwrap();
            assert!(matches!(operator.on_timer(ts(10)), Err(Error::Aggregate(_))));
        }
    }

    #[test]
    fn test_discard() {
        let mut operator = sliding_operator(AccumulationMode::Aggregating);
        operator.on_element("a", 1, ts(6)).unwrap();
        operator.on_element("b", 1, ts(6)).unwrap();
        assert_eq!(operator.discard(), 4);
        assert_eq!(operator.pane_count(), 0);
        assert!(operator.on_timer(ts(100)).unwrap().is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Element(u8, i64),
            Timer(i64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (0u8..3, 0i64..200).prop_map(|(key, t)| Op::Element(key, t)),
                1 => (1i64..45).prop_map(Op::Timer),
            ]
        }

        fn value() -> impl Strategy<Value = i64> {
            prop_oneof![
                Just(i64::MAX),
                Just(i64::MIN),
                -100i64..100,
                any::<i64>(),
            ]
        }

        fn fire(
            operator: &mut WindowOperator<Sum>,
            deadline: i64,
            actual: &mut HashMap<(String, Window), i64>,
        ) -> std::result::Result<(), TestCaseError> {
            for result in operator.on_timer(ts(deadline)).unwrap() {
                prop_assert!(result.window.end_millis() <= deadline);
                let previous = actual.insert((result.key, result.window), result.value);
                prop_assert!(previous.is_none(), "window fired twice");
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn panes_are_released_exactly_when_windows_fire(
                slide in 1i64..10,
                panes_per_window in 1i64..5,
                ops in proptest::collection::vec(op(), 0..150),
                accumulating in any::<bool>()
            ) {
                let size = slide * panes_per_window;
                let assigner = WindowAssigner::sliding(
                    Duration::from_millis(size as u64),
                    Duration::from_millis(slide as u64),
                ).unwrap();
                let mode = if accumulating {
                    AccumulationMode::Accumulating
                } else {
                    AccumulationMode::Aggregating
                };
                let mut operator = WindowOperator::new(assigner, Arc::new(Sum), mode, 0);

                // reference: an element counts for every window containing it which has not been
                // closed by a deadline processed before it
                let mut expected: HashMap<(String, Window), i64> = HashMap::new();
                let mut max_deadline = i64::MIN;
                let mut actual: HashMap<(String, Window), i64> = HashMap::new();

                for op in ops {
                    match op {
                        Op::Element(key, t) => {
                            let key = format!("key-{key}");
                            operator.on_element(&key, 1, ts(t)).unwrap();
                            // stamped before the last deadline means it arrived at that deadline
                            let t = t.max(max_deadline);
                            for window in assigner.assign_windows(ts(t)) {
                                if window.end_millis() > max_deadline {
                                    *expected.entry((key.clone(), window)).or_default() += 1;
                                }
                            }
                        }
                        Op::Timer(n) => {
                            let deadline = n * slide;
                            max_deadline = max_deadline.max(deadline);
                            fire(&mut operator, deadline, &mut actual)?;
                        }
                    }
                    // a pane is only kept while a pending window covers it
                    prop_assert!(operator.pane_count() <= operator.pending_windows() * panes_per_window as usize);
                }

                fire(&mut operator, 1_000, &mut actual)?;
                prop_assert_eq!(operator.pending_windows(), 0);
                prop_assert_eq!(operator.pane_count(), 0);
                prop_assert_eq!(actual, expected);
            }

            #[test]
            fn accumulation_modes_give_identical_output(
                slide in 1i64..6,
                panes_per_window in 1i64..4,
                mut elements in proptest::collection::vec((0i64..50, value()), 0..40)
            ) {
                elements.sort_by_key(|(t, _)| *t);
                let size = slide * panes_per_window;
                let assigner = WindowAssigner::sliding(
                    Duration::from_millis(size as u64),
                    Duration::from_millis(slide as u64),
                ).unwrap();
                let mut aggregating =
                    WindowOperator::new(assigner, Arc::new(Sum), AccumulationMode::Aggregating, 0);
                let mut accumulating =
                    WindowOperator::new(assigner, Arc::new(Sum), AccumulationMode::Accumulating, 0);

                // direct fold of every window, in i128 so it cannot overflow
                let mut direct: BTreeMap<i64, i128> = BTreeMap::new();
                for (t, value) in &elements {
                    aggregating.on_element("k", *value, ts(*t)).unwrap();
                    accumulating.on_element("k", *value, ts(*t)).unwrap();
                    for window in assigner.assign_windows(ts(*t)) {
                        *direct.entry(window.end_millis()).or_default() += i128::from(*value);
                    }
                }

                let from_aggregating = aggregating.on_timer(ts(1_000));
                let from_accumulating = accumulating.on_timer(ts(1_000));
                prop_assert_eq!(&from_aggregating, &from_accumulating);

                let expected: Option<Vec<i64>> = direct
                    .values()
                    .map(|sum| i64::try_from(*sum).ok())
                    .collect();
                match expected {
                    Some(expected) => {
                        let values: Vec<i64> =
                            from_aggregating.unwrap().iter().map(|r| r.value).collect();
                        prop_assert_eq!(values, expected);
                    }
                    None => prop_assert!(from_aggregating.is_err()),
                }
            }
        }
    }
}
