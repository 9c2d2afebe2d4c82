//! Pane level state of a single key. Every pane holds the contribution of the elements which fell
//! into its `slide` sized interval, either as a running accumulator or as the raw elements
//! depending on the [AccumulationMode]. A window result is assembled by merging the panes it is
//! made of, so an element is added exactly once no matter how many windows it belongs to.
//!
//! A pane is reference counted by the pending windows which cover it. The count is taken when a
//! window is registered and released when it fires, the pane is evicted when nothing references it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::function::{AccumulationMode, WindowFunction};
use crate::windower::{Pane, Window};

enum PaneContents<I, A> {
    Elements(Vec<I>),
    Partial(A),
}

struct PaneSlot<I, A> {
    /// None until the first element touches the pane.
    contents: Option<PaneContents<I, A>>,
    /// Number of pending windows referencing the pane.
    refs: usize,
}

impl<I, A> Default for PaneSlot<I, A> {
    fn default() -> Self {
        Self {
            contents: None,
            refs: 0,
        }
    }
}

pub struct PaneAccumulator<F: WindowFunction> {
    function: Arc<F>,
    mode: AccumulationMode,
    /// Panes keyed by their start time in millis.
    panes: BTreeMap<i64, PaneSlot<F::Input, F::Accumulator>>,
}

impl<F: WindowFunction> PaneAccumulator<F> {
    pub fn new(function: Arc<F>, mode: AccumulationMode) -> Self {
        Self {
            function,
            mode,
            panes: BTreeMap::new(),
        }
    }

    /// Applies the element to the pane, creating the pane on first touch.
    pub fn fold_into(&mut self, pane: Pane, element: F::Input) -> Result<()> {
        let slot = self.panes.entry(pane.start_millis()).or_default();

        match self.mode {
            AccumulationMode::Aggregating => {
                let contents = slot.contents.get_or_insert_with(|| {
                    PaneContents::Partial(self.function.create_accumulator())
                });
                match contents {
                    PaneContents::Partial(acc) => self.function.add(acc, &element),
                    PaneContents::Elements(_) => Err(Error::Aggregate(format!(
                        "{pane} holds raw elements in aggregating mode"
                    ))),
                }
            }
            AccumulationMode::Accumulating => {
                let contents = slot
                    .contents
                    .get_or_insert_with(|| PaneContents::Elements(Vec::new()));
                match contents {
                    PaneContents::Elements(elements) => {
                        elements.push(element);
                        Ok(())
                    }
                    PaneContents::Partial(_) => Err(Error::Aggregate(format!(
                        "{pane} holds a partial aggregate in accumulating mode"
                    ))),
                }
            }
        }
    }

    /// Merges, in increasing start order, the panes within the window and produces the window
    /// output. Pane state is left untouched since the panes are shared with overlapping windows.
    pub fn assemble(&self, window: &Window) -> Result<F::Output> {
        let mut acc = self.function.create_accumulator();

        for slot in self
            .panes
            .range(window.start_millis()..window.end_millis())
            .map(|(_, slot)| slot)
        {
            match &slot.contents {
                Some(PaneContents::Partial(partial)) => self.function.merge(&mut acc, partial)?,
                Some(PaneContents::Elements(elements)) => {
                    for element in elements {
                        self.function.add(&mut acc, element)?;
                    }
                }
                None => {}
            }
        }

        self.function.finish(acc)
    }

    /// Takes a reference on the pane for a newly registered window.
    pub fn retain(&mut self, pane: Pane) {
        self.panes.entry(pane.start_millis()).or_default().refs += 1;
    }

    /// Releases a reference taken by [Self::retain]. Returns true if this was the last reference
    /// and the pane got evicted.
    pub fn release(&mut self, pane: Pane) -> bool {
        let Some(slot) = self.panes.get_mut(&pane.start_millis()) else {
            warn!(%pane, "Releasing an unknown pane");
            return false;
        };

        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.panes.remove(&pane.start_millis());
            return true;
        }
        false
    }

    /// Removes the pane state. Refused while a pending window still references the pane.
    pub fn evict(&mut self, pane: Pane) -> Result<()> {
        let start_millis = pane.start_millis();
        match self.panes.get(&start_millis) {
            Some(slot) if slot.refs > 0 => Err(Error::PaneInUse {
                start_millis,
                refs: slot.refs,
            }),
            Some(_) => {
                self.panes.remove(&start_millis);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Number of pending windows referencing the pane.
    pub fn refs(&self, pane: Pane) -> usize {
        self.panes
            .get(&pane.start_millis())
            .map_or(0, |slot| slot.refs)
    }

    pub fn contains(&self, pane: Pane) -> bool {
        self.panes.contains_key(&pane.start_millis())
    }

    pub fn len(&self) -> usize {
        self.panes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }
}
