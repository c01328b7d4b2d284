//! Consensus-change subscription bus.
//!
//! The chain store is the single producer of an append-only change log; each
//! subscriber gets its own worker that walks the log in order, so delivery is
//! exactly-once and ordered per subscriber. A slow subscriber only delays
//! itself: the producer appends and moves on, and the laggard catches up from
//! the durable log.

use std::sync::Arc;
use std::thread;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{ConsensusError, Result};
use crate::types::ConsensusChangeId;
use crate::utxo::ConsensusChange;

/// A consumer of the ordered change stream. Implementations own their derived
/// state and must process each change to completion before returning.
pub trait ConsensusSubscriber: Send + Sync {
    fn process_consensus_change(&self, change: &ConsensusChange);
}

struct LogState {
    entries: Vec<ConsensusChange>,
    closed: bool,
}

/// The durable suffix of the change stream, shared between the producer and
/// all subscriber workers.
pub struct ChangeLog {
    state: Mutex<LogState>,
    cond: Condvar,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog {
            state: Mutex::new(LogState {
                entries: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, change: ConsensusChange) {
        let mut state = self.state.lock();
        state.entries.push(change);
        drop(state);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first entry strictly after `cursor`.
    fn index_after(&self, cursor: ConsensusChangeId) -> Result<usize> {
        if cursor == ConsensusChangeId::BEGINNING {
            return Ok(0);
        }
        let state = self.state.lock();
        state
            .entries
            .iter()
            .position(|c| c.id == cursor)
            .map(|idx| idx + 1)
            .ok_or(ConsensusError::InvalidChangeCursor)
    }

    /// All entries recorded after `cursor`.
    pub fn entries_since(&self, cursor: ConsensusChangeId) -> Result<Vec<ConsensusChange>> {
        let start = self.index_after(cursor)?;
        let state = self.state.lock();
        Ok(state.entries[start.min(state.entries.len())..].to_vec())
    }

    /// Block until entry `index` exists, returning `None` once closed with no
    /// further entries.
    fn wait_for(&self, index: usize) -> Option<ConsensusChange> {
        let mut state = self.state.lock();
        loop {
            if state.entries.len() > index {
                return Some(state.entries[index].clone());
            }
            if state.closed {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        ChangeLog::new()
    }
}

struct Progress {
    state: Mutex<(usize, bool)>,
    cond: Condvar,
}

impl Progress {
    fn new(start: usize) -> Self {
        Progress {
            state: Mutex::new((start, false)),
            cond: Condvar::new(),
        }
    }

    fn advance_to(&self, index: usize) {
        let mut state = self.state.lock();
        state.0 = index;
        drop(state);
        self.cond.notify_all();
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.1 = true;
        drop(state);
        self.cond.notify_all();
    }

    fn wait_until(&self, target: usize) {
        let mut state = self.state.lock();
        while state.0 < target && !state.1 {
            self.cond.wait(&mut state);
        }
    }
}

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
    progress: Arc<Progress>,
}

/// Fan-out of the change log to subscribers, one worker thread each.
pub struct SubscriptionBus {
    log: Arc<ChangeLog>,
    workers: Mutex<Vec<Worker>>,
}

impl SubscriptionBus {
    pub fn new(log: Arc<ChangeLog>) -> Self {
        SubscriptionBus {
            log,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    /// Register a subscriber at `cursor`. Every change already recorded after
    /// the cursor is delivered before this call returns, so the subscriber
    /// observes a consistent prefix; later changes arrive on its worker.
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        cursor: ConsensusChangeId,
    ) -> Result<()> {
        let start = self.log.index_after(cursor)?;
        let progress = Arc::new(Progress::new(start));
        let log = Arc::clone(&self.log);
        let worker_progress = Arc::clone(&progress);
        let handle = thread::spawn(move || {
            let mut index = start;
            while let Some(change) = log.wait_for(index) {
                subscriber.process_consensus_change(&change);
                index += 1;
                worker_progress.advance_to(index);
            }
            worker_progress.finish();
            debug!("subscriber worker exiting at change index {index}");
        });

        let replay_target = self.log.len();
        self.workers.lock().push(Worker {
            handle: Some(handle),
            progress: Arc::clone(&progress),
        });
        progress.wait_until(replay_target);
        Ok(())
    }

    /// Block until every subscriber has processed all currently recorded
    /// changes.
    pub fn flush(&self) {
        let target = self.log.len();
        let workers = self.workers.lock();
        for worker in workers.iter() {
            worker.progress.wait_until(target);
        }
    }

    /// Stop delivery: workers drain the log, then exit and are joined.
    pub fn close(&self) {
        self.log.close();
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SubscriptionBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::consensus_change_id;
    use parking_lot::Mutex as PMutex;

    struct Recorder {
        seen: PMutex<Vec<ConsensusChangeId>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                seen: PMutex::new(Vec::new()),
            })
        }
    }

    impl ConsensusSubscriber for Recorder {
        fn process_consensus_change(&self, change: &ConsensusChange) {
            self.seen.lock().push(change.id);
        }
    }

    fn change(seq: u64) -> ConsensusChange {
        ConsensusChange::new(consensus_change_id(seq))
    }

    #[test]
    fn replays_from_the_beginning() {
        let log = Arc::new(ChangeLog::new());
        log.push(change(1));
        log.push(change(2));
        let bus = SubscriptionBus::new(Arc::clone(&log));
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone(), ConsensusChangeId::BEGINNING)
            .unwrap();
        assert_eq!(
            *recorder.seen.lock(),
            vec![consensus_change_id(1), consensus_change_id(2)]
        );
        bus.close();
    }

    #[test]
    fn resumes_after_a_cursor() {
        let log = Arc::new(ChangeLog::new());
        log.push(change(1));
        log.push(change(2));
        log.push(change(3));
        let bus = SubscriptionBus::new(Arc::clone(&log));
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone(), consensus_change_id(2)).unwrap();
        assert_eq!(*recorder.seen.lock(), vec![consensus_change_id(3)]);
        bus.close();
    }

    #[test]
    fn unknown_cursor_is_rejected() {
        let log = Arc::new(ChangeLog::new());
        log.push(change(1));
        let bus = SubscriptionBus::new(Arc::clone(&log));
        let recorder = Recorder::new();
        assert_eq!(
            bus.subscribe(recorder, consensus_change_id(99)),
            Err(ConsensusError::InvalidChangeCursor)
        );
        bus.close();
    }

    #[test]
    fn live_changes_arrive_in_order_exactly_once() {
        let log = Arc::new(ChangeLog::new());
        let bus = SubscriptionBus::new(Arc::clone(&log));
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone(), ConsensusChangeId::BEGINNING)
            .unwrap();
        for seq in 1..=20 {
            log.push(change(seq));
        }
        bus.flush();
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 20);
        for (i, id) in seen.iter().enumerate() {
            assert_eq!(*id, consensus_change_id(i as u64 + 1));
        }
        bus.close();
    }

    #[test]
    fn each_subscriber_has_its_own_pace() {
        let log = Arc::new(ChangeLog::new());
        log.push(change(1));
        let bus = SubscriptionBus::new(Arc::clone(&log));
        let early = Recorder::new();
        bus.subscribe(early.clone(), ConsensusChangeId::BEGINNING)
            .unwrap();
        log.push(change(2));
        let late = Recorder::new();
        bus.subscribe(late.clone(), consensus_change_id(1)).unwrap();
        bus.flush();
        assert_eq!(
            *early.seen.lock(),
            vec![consensus_change_id(1), consensus_change_id(2)]
        );
        assert_eq!(*late.seen.lock(), vec![consensus_change_id(2)]);
        bus.close();
    }

    #[test]
    fn entries_since_cursor() {
        let log = ChangeLog::new();
        log.push(change(1));
        log.push(change(2));
        let all = log.entries_since(ConsensusChangeId::BEGINNING).unwrap();
        assert_eq!(all.len(), 2);
        let tail = log.entries_since(consensus_change_id(1)).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(log.entries_since(consensus_change_id(9)).is_err());
    }
}
