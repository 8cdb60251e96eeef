// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure to support line interrupts.

#![warn(missing_docs)]

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

/// A sink for line interrupt state changes.
///
/// Unless you're implementing an interrupt controller or a CPU model, you
/// shouldn't be using this trait. Devices are expected to use
/// [`LineInterrupt`], which decouples the details of vector numbers and
/// wiring from concrete device implementations.
pub trait LineSetTarget: Send + Sync {
    /// Set an interrupt line state.
    fn set_irq(&self, vector: u32, high: bool);
}

struct Target {
    debug_label: Arc<str>,
    inner: Arc<dyn LineSetTarget>,
    vector: u32,
}

impl Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("debug_label", &self.debug_label)
            .field("vector", &self.vector)
            .finish()
    }
}

#[derive(Debug)]
struct LineInterruptInner {
    debug_label: Cow<'static, str>,
    targets: Vec<Target>,
    is_high: bool,
}

/// A line interrupt, representing a (virtually) physical wire between a
/// device and an interrupt controller or CPU.
///
/// Raising an already-high line (or lowering an already-low one) is
/// idempotent: targets are only told about level changes.
pub struct LineInterrupt {
    inner: Mutex<LineInterruptInner>,
}

impl Debug for LineInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineInterrupt")
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl LineInterrupt {
    /// Creates a line that is not attached to any target.
    ///
    /// This is useful for testing purposes.
    pub fn detached() -> Self {
        Self {
            inner: Mutex::new(LineInterruptInner {
                debug_label: "detached".into(),
                targets: Vec::new(),
                is_high: false,
            }),
        }
    }

    /// Creates a new line interrupt wired to `target` at `vector`.
    pub fn new_with_target(
        debug_label: impl Into<Cow<'static, str>>,
        target: Arc<dyn LineSetTarget>,
        vector: u32,
    ) -> Self {
        let debug_label = debug_label.into();
        Self {
            inner: Mutex::new(LineInterruptInner {
                targets: vec![Target {
                    debug_label: debug_label.as_ref().into(),
                    inner: target,
                    vector,
                }],
                debug_label,
                is_high: false,
            }),
        }
    }

    /// Attaches an additional target to the line.
    ///
    /// If the line is currently high, the target is told immediately.
    pub fn add_target(&self, debug_label: impl Into<Arc<str>>, target: Arc<dyn LineSetTarget>, vector: u32) {
        let mut inner = self.inner.lock();
        if inner.is_high {
            target.set_irq(vector, true);
        }
        inner.targets.push(Target {
            debug_label: debug_label.into(),
            inner: target,
            vector,
        });
    }

    /// Sets the line level high or low.
    pub fn set_level(&self, high: bool) {
        let mut inner = self.inner.lock();
        if inner.is_high == high {
            return;
        }
        inner.is_high = high;

        if high && inner.targets.is_empty() {
            tracelimit::warn_ratelimited!(
                label = inner.debug_label.as_ref(),
                "LineInterrupt not hooked up to any targets!"
            );
        }

        for target in inner.targets.iter() {
            target.inner.set_irq(target.vector, high);
        }
    }

    /// Returns the current line level.
    pub fn is_high(&self) -> bool {
        self.inner.lock().is_high
    }
}

#[allow(missing_docs)] // self explanatory struct/functions
pub mod test_helpers {
    use crate::line_interrupt::LineSetTarget;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// A [`LineSetTarget`] that just records line levels, for tests.
    pub struct TestLineInterruptTarget {
        state: Mutex<BTreeMap<u32, bool>>,
    }

    impl TestLineInterruptTarget {
        pub fn new_arc() -> Arc<TestLineInterruptTarget> {
            Arc::new(TestLineInterruptTarget {
                state: Default::default(),
            })
        }

        pub fn is_high(&self, vector: u32) -> bool {
            self.state.lock().get(&vector).copied().unwrap_or(false)
        }
    }

    impl LineSetTarget for TestLineInterruptTarget {
        fn set_irq(&self, vector: u32, high: bool) {
            self.state.lock().insert(vector, high);
        }
    }
}
