// ── Loopback monitor queue ──
//
// A bounded element queue per subscription. Elements handed to the client
// count against the capacity until released; when the queue is full, new
// updates fold into the newest queued element and mark overrun bits.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::Shared;
use super::dispatch::Dispatcher;
use super::record::Record;
use crate::request::FieldSelection;
use crate::status::Status;
use crate::transport::{Callback, Monitor, MonitorElement, MonitorEvent};
use crate::value::{BitSet, PvStructure};

pub(crate) const DEFAULT_QUEUE_SIZE: usize = 4;
const MIN_QUEUE_SIZE: usize = 2;

pub(crate) struct LoopbackMonitor {
    me: Weak<LoopbackMonitor>,
    record: Arc<Record>,
    selection: FieldSelection,
    shape: PvStructure,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    events: Callback<MonitorEvent>,
    queue: Mutex<Queue>,
}

struct Queue {
    capacity: usize,
    started: bool,
    destroyed: bool,
    queued: VecDeque<MonitorElement>,
    outstanding: usize,
    /// Update received while every slot was handed out.
    overflow: Option<MonitorElement>,
}

impl LoopbackMonitor {
    pub(crate) fn new(
        record: Arc<Record>,
        selection: FieldSelection,
        shape: PvStructure,
        queue_size: Option<usize>,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        events: Callback<MonitorEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            record,
            selection,
            shape,
            shared,
            dispatcher,
            events,
            queue: Mutex::new(Queue {
                capacity: queue_size.unwrap_or(DEFAULT_QUEUE_SIZE).max(MIN_QUEUE_SIZE),
                started: false,
                destroyed: false,
                queued: VecDeque::new(),
                outstanding: 0,
                overflow: None,
            }),
        })
    }

    /// Offer a record update. Called with the record lock held.
    pub(crate) fn push(&self, record_value: &PvStructure, record_changed: &BitSet) {
        let mut queue = self.queue.lock();
        if !queue.started || queue.destroyed {
            return;
        }
        let changed = map_changed(record_value, record_changed, &self.shape);
        if changed.is_empty() {
            return;
        }
        let Ok(value) = record_value.select(&self.selection) else {
            return;
        };

        let element = MonitorElement {
            value,
            changed,
            overrun: BitSet::new(),
        };
        if queue.queued.len() + queue.outstanding < queue.capacity {
            queue.queued.push_back(element);
        } else if let Some(last) = queue.queued.back_mut() {
            merge(last, element);
        } else {
            match queue.overflow.as_mut() {
                Some(held) => merge(held, element),
                None => queue.overflow = Some(element),
            }
            trace!(record = %self.record.name(), "monitor queue full, update held");
            return;
        }
        drop(queue);
        self.post_event();
    }

    pub(crate) fn unlisten(&self) {
        {
            let mut queue = self.queue.lock();
            queue.started = false;
            queue.destroyed = true;
        }
        let events = Arc::clone(&self.events);
        self.dispatcher.post(move || events(MonitorEvent::Unlisten));
    }

    fn post_event(&self) {
        let events = Arc::clone(&self.events);
        self.dispatcher.post(move || events(MonitorEvent::Event));
    }
}

/// Fold `newer` into `held`: bits already changed and changed again overrun.
fn merge(held: &mut MonitorElement, newer: MonitorElement) {
    let again = held.changed.and(&newer.changed);
    held.overrun |= &again;
    held.overrun |= &newer.overrun;
    held.changed |= &newer.changed;
    held.value = newer.value;
}

/// Translate record offsets into offsets of the selected shape.
///
/// A changed field that is not selected maps to its nearest selected
/// ancestor, or is dropped if none exists.
fn map_changed(record: &PvStructure, bits: &BitSet, shape: &PvStructure) -> BitSet {
    let mut out = BitSet::new();
    for bit in bits.iter() {
        let Some(path) = record.path_of(bit) else {
            continue;
        };
        if path.is_empty() {
            out.set(0);
            continue;
        }
        let mut candidate = path.as_str();
        loop {
            if let Some(offset) = shape.offset_of(candidate) {
                out.set(offset);
                break;
            }
            match candidate.rfind('.') {
                Some(i) => candidate = &candidate[..i],
                None => break,
            }
        }
    }
    out
}

impl Monitor for LoopbackMonitor {
    fn start(&self) -> Status {
        let Some(me) = self.me.upgrade() else {
            return Status::error("monitor was destroyed");
        };
        {
            let mut queue = self.queue.lock();
            if queue.destroyed {
                return Status::error("monitor was destroyed");
            }
            if queue.started {
                return Status::ok();
            }
            queue.started = true;
        }
        self.record.start_monitor(&me);
        Status::ok()
    }

    fn stop(&self) -> Status {
        let mut queue = self.queue.lock();
        queue.started = false;
        queue.queued.clear();
        queue.overflow = None;
        Status::ok()
    }

    fn poll(&self) -> Option<MonitorElement> {
        let mut queue = self.queue.lock();
        let element = queue.queued.pop_front()?;
        queue.outstanding += 1;
        Some(element)
    }

    fn release(&self, _element: MonitorElement) {
        let mut queue = self.queue.lock();
        queue.outstanding = queue.outstanding.saturating_sub(1);
        if queue.started && queue.queued.len() + queue.outstanding < queue.capacity {
            if let Some(held) = queue.overflow.take() {
                queue.queued.push_back(held);
                drop(queue);
                self.post_event();
            }
        }
    }

    fn pending(&self) -> usize {
        self.queue.lock().queued.len()
    }

    fn destroy(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.destroyed {
                return;
            }
            queue.destroyed = true;
            queue.started = false;
            queue.queued.clear();
            queue.overflow = None;
        }
        self.shared.note_released();
        self.record.detach_monitor(self);
    }
}
