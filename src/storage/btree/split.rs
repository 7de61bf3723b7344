//! Node overflow: split requests and the worker pool that runs them.

use std::fmt;
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::codecs::Codec;
use super::page::{KeyPage, PageEnv, PageRef};
use super::slot::{KeySlot, ValueSlot};
use crate::primitives::concurrency::barrier;
use crate::types::{Result, StoreError};

/// Which half of a full page a split extracts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitSide {
    /// Lower `T - 1` entries and `T` children; the new page lands at child `T - 1`.
    Left,
    /// Upper `T - 1` entries and `T` children; the new page lands at child `T`.
    Right,
}

impl fmt::Display for SplitSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitSide::Left => f.write_str("left"),
            SplitSide::Right => f.write_str("right"),
        }
    }
}

/// Moves one half of a full page into a freshly allocated sibling.
///
/// The source keeps its key count; promoting the median is the caller's job
/// (`take_median` after a RIGHT split, `collapse_to_median` after LEFT + RIGHT).
pub struct SplitRequest<K, V> {
    env: Arc<PageEnv>,
    source: PageRef<K, V>,
    side: SplitSide,
    new_page: Option<PageRef<K, V>>,
}

impl<K, V> fmt::Debug for SplitRequest<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitRequest")
            .field("source", &self.source)
            .field("side", &self.side)
            .field("new_page", &self.new_page)
            .finish()
    }
}

impl<K: Codec + Ord, V: Codec> SplitRequest<K, V> {
    /// Prepares a split of `source`.
    pub fn new(source: PageRef<K, V>, side: SplitSide) -> Self {
        Self {
            env: Arc::clone(source.env()),
            source,
            side,
            new_page: None,
        }
    }

    /// Side being extracted.
    pub fn side(&self) -> SplitSide {
        self.side
    }

    /// Page being split.
    pub fn source(&self) -> &PageRef<K, V> {
        &self.source
    }

    /// Runs the transfer under the source page's lock.
    pub fn process(&mut self) -> Result<()> {
        let layout = self.env.layout();
        let (max, t) = (layout.max_keys(), layout.degree());
        let mut src = self.source.lock();
        if src.num_keys() != max {
            return Err(StoreError::Invariant(format!(
                "{} split of page {} holding {} of {max} keys",
                self.side,
                self.source.id(),
                src.num_keys()
            )));
        }
        let (key_from, child_from, install) = match self.side {
            SplitSide::Left => (0, 0, t - 1),
            SplitSide::Right => (t, t, t),
        };
        if let Some(i) = (key_from..key_from + t - 1).find(|&i| src.st.keys[i].is_empty()) {
            return Err(StoreError::Invariant(format!(
                "{} split of page {} found slot {i} already moved",
                self.side,
                self.source.id()
            )));
        }

        let new_page = KeyPage::<K, V>::create(&self.env, true)?;
        {
            let mut dst = new_page.lock();
            for j in 0..t - 1 {
                dst.st.keys[j] = mem::replace(&mut src.st.keys[key_from + j], KeySlot::Empty);
                dst.st.values[j] =
                    mem::replace(&mut src.st.values[key_from + j], ValueSlot::Empty);
            }
            let mut has_children = false;
            for j in 0..t {
                let slot = mem::take(&mut src.st.children[child_from + j]);
                has_children |= !slot.is_empty();
                dst.st.children[j] = slot;
            }
            dst.st.num_keys = t - 1;
            dst.st.leaf = !has_children;
            dst.st.dirty = true;
        }
        src.set_child(install, Some(Arc::clone(&new_page)))?;
        match self.side {
            SplitSide::Left => self.env.stats().inc_left_splits(),
            SplitSide::Right => self.env.stats().inc_right_splits(),
        }
        debug!(
            side = %self.side,
            source = %self.source.id(),
            new_page = %new_page.id(),
            "btree.split.process"
        );
        self.new_page = Some(new_page);
        Ok(())
    }

    /// The new page produced by [`SplitRequest::process`].
    pub fn result(&self) -> Result<PageRef<K, V>> {
        self.new_page.clone().ok_or_else(|| {
            StoreError::Invariant(format!(
                "{} split of page {} has not run",
                self.side,
                self.source.id()
            ))
        })
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads running split requests.
pub struct SplitPool {
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl SplitPool {
    /// Starts `threads` workers; zero runs every request on the dispatching thread.
    pub fn new(threads: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("blocktree-split-{idx}"))
                .spawn(move || Self::worker_loop(rx))
                .map_err(StoreError::from)?;
            workers.push(handle);
        }
        info!(threads, "btree.split_pool.start");
        Ok(Self {
            tx: Mutex::new((threads > 0).then_some(tx)),
            workers: Mutex::new(workers),
            threads,
        })
    }

    fn worker_loop(rx: Arc<Mutex<Receiver<Task>>>) {
        loop {
            let task = rx.lock().recv();
            match task {
                Ok(task) => task(),
                Err(_) => break,
            }
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs every request concurrently and waits at one barrier until all are done.
    ///
    /// Requests come back in completion order; the first failure is reported after
    /// every participant has finished.
    pub fn dispatch<K, V>(&self, requests: Vec<SplitRequest<K, V>>) -> Result<Vec<SplitRequest<K, V>>>
    where
        K: Codec + Ord,
        V: Codec,
    {
        let (parts, waiter) = barrier(requests.len());
        for (mut req, done) in requests.into_iter().zip(parts) {
            let task: Task = Box::new(move || {
                let outcome = req.process().map(|()| req);
                done.complete(outcome);
            });
            self.submit(task);
        }
        waiter.wait()
    }

    fn submit(&self, task: Task) {
        if self.threads == 0 {
            task();
            return;
        }
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task),
            None => Err(mpsc::SendError(task)),
        };
        if sent.is_err() {
            // Dropping the task drops its completion, which releases the barrier.
            warn!("btree.split_pool.closed");
        }
    }

    /// Stops the workers once queued requests have run.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let workers = mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("btree.split_pool.worker_panicked");
            }
        }
    }
}

impl Drop for SplitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
