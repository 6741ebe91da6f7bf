//! Instrumented in-process backend for exercising the locking and close
//! paths without a real engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{DbError, DbResult};
use crate::native::{NativeDb, StmtPtr};

/// Observations shared between a [`MockDb`] and the test that owns it.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    active: AtomicUsize,
    calls: AtomicUsize,
    overlaps: AtomicUsize,
    db_closed: AtomicBool,
    finalized: Mutex<Vec<StmtPtr>>,
    failures: Mutex<HashMap<StmtPtr, DbError>>,
}

impl MockProbe {
    /// Makes finalize of `ptr` fail with `err`.
    pub fn fail_finalize(&self, ptr: StmtPtr, err: DbError) {
        self.inner
            .failures
            .lock()
            .expect("failures lock")
            .insert(ptr, err);
    }

    /// Completed [`MockDb::instrumented_call`]s.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Native calls that started while another one was running.
    pub fn overlaps(&self) -> usize {
        self.inner.overlaps.load(Ordering::SeqCst)
    }

    /// Pointers passed to finalize, in call order.
    pub fn finalized(&self) -> Vec<StmtPtr> {
        self.inner.finalized.lock().expect("finalized lock").clone()
    }

    /// Whether the database handle was closed.
    pub fn db_closed(&self) -> bool {
        self.inner.db_closed.load(Ordering::SeqCst)
    }

    fn enter(&self) -> NativeCall<'_> {
        if self.inner.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.inner.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        NativeCall { probe: self }
    }
}

/// Marks the span of one native call.
struct NativeCall<'a> {
    probe: &'a MockProbe,
}

impl Drop for NativeCall<'_> {
    fn drop(&mut self) {
        self.probe.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fake native database recording every call into its [`MockProbe`].
#[derive(Debug, Default)]
pub struct MockDb {
    probe: MockProbe,
}

impl MockDb {
    pub fn with_probe(probe: &MockProbe) -> Self {
        Self {
            probe: probe.clone(),
        }
    }

    /// A native call that holds the handle for `hold` to widen race windows.
    pub fn instrumented_call(&mut self, hold: Duration) {
        let _call = self.probe.enter();
        thread::sleep(hold);
        self.probe.inner.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl NativeDb for MockDb {
    fn finalize(&mut self, stmt: StmtPtr) -> DbResult<i32> {
        let _call = self.probe.enter();
        self.probe
            .inner
            .finalized
            .lock()
            .expect("finalized lock")
            .push(stmt);
        let failure = self
            .probe
            .inner
            .failures
            .lock()
            .expect("failures lock")
            .get(&stmt)
            .cloned();
        failure.map_or(Ok(0), Err)
    }

    fn close(&mut self) -> DbResult<()> {
        self.probe.inner.db_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
