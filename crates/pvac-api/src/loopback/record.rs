// ── Loopback records ──
//
// In-memory endpoints backing loopback channels. Each record owns its
// value and keeps weak links to the channels attached to it and to the
// monitors subscribed to it. Lock order is record → monitor queue; channel
// locks are never taken while a record lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::channel::LoopbackChannel;
use super::monitor::LoopbackMonitor;
use crate::error::Error;
use crate::request::FieldSelection;
use crate::status::Status;
use crate::value::nt::TimeStamp;
use crate::value::{BitSet, PvField, PvStructure, convert_field};

/// Server-side RPC implementation: arguments in, result or failure out.
pub type RpcHandler = Arc<dyn Fn(&PvStructure) -> Result<PvStructure, Status> + Send + Sync>;

pub(crate) struct Record {
    name: String,
    state: Mutex<RecordState>,
}

struct RecordState {
    value: PvStructure,
    online: bool,
    process_count: u64,
    rpc: Option<RpcHandler>,
    channels: Vec<Weak<LoopbackChannel>>,
    monitors: Vec<Weak<LoopbackMonitor>>,
}

impl Record {
    pub(crate) fn new(name: &str, value: PvStructure, rpc: Option<RpcHandler>) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(RecordState {
                value,
                online: true,
                process_count: 0,
                rpc,
                channels: Vec::new(),
                monitors: Vec::new(),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn snapshot(&self) -> PvStructure {
        self.state.lock().value.clone()
    }

    pub(crate) fn select(&self, selection: &FieldSelection) -> Result<PvStructure, Error> {
        self.state.lock().value.select(selection)
    }

    pub(crate) fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub(crate) fn process_count(&self) -> u64 {
        self.state.lock().process_count
    }

    pub(crate) fn rpc_handler(&self) -> Option<RpcHandler> {
        self.state.lock().rpc.clone()
    }

    // ── Mutation ─────────────────────────────────────────────────

    /// Apply the fields of `src` marked in `changed`.
    ///
    /// Conversion happens on a copy; the record is only updated when every
    /// marked field converted, so a failed put leaves it untouched.
    pub(crate) fn write(&self, src: &PvStructure, changed: &BitSet, process: bool) -> Status {
        let mut state = self.state.lock();
        let mut next = state.value.clone();
        let mut record_changed = BitSet::new();

        for bit in changed.iter() {
            let Some(path) = src.path_of(bit) else {
                continue;
            };
            if path.is_empty() {
                for (name, field) in src.fields() {
                    if let Err(e) = assign(&mut next, name, field, &mut record_changed) {
                        return Status::error(e.to_string());
                    }
                }
                continue;
            }
            let Some(field) = src.field(&path) else {
                continue;
            };
            if let Err(e) = assign(&mut next, &path, field, &mut record_changed) {
                return Status::error(e.to_string());
            }
        }

        if process {
            touch_time_stamp(&mut next, &mut record_changed);
            state.process_count += 1;
        }
        if record_changed.is_empty() {
            return Status::ok();
        }

        state.value = next;
        trace!(record = %self.name, changed = %record_changed, "record written");
        notify_monitors(&mut state, &record_changed);
        Status::ok()
    }

    /// Server-side write of one field, as an IOC-internal update would.
    pub(crate) fn write_field(&self, path: &str, field: &PvField) -> Result<(), Error> {
        let mut state = self.state.lock();
        let mut changed = BitSet::new();
        let mut next = state.value.clone();
        assign(&mut next, path, field, &mut changed)?;
        touch_time_stamp(&mut next, &mut changed);
        state.value = next;
        notify_monitors(&mut state, &changed);
        Ok(())
    }

    /// Process the record: bump its time stamp and notify subscribers.
    pub(crate) fn process(&self) -> Status {
        let mut state = self.state.lock();
        let mut changed = BitSet::new();
        let mut next = state.value.clone();
        touch_time_stamp(&mut next, &mut changed);
        state.value = next;
        state.process_count += 1;
        debug!(record = %self.name, count = state.process_count, "record processed");
        if !changed.is_empty() {
            notify_monitors(&mut state, &changed);
        }
        Status::ok()
    }

    // ── Links ────────────────────────────────────────────────────

    pub(crate) fn attach_channel(&self, channel: &Arc<LoopbackChannel>) -> bool {
        let mut state = self.state.lock();
        state.channels.retain(|w| w.strong_count() > 0);
        state.channels.push(Arc::downgrade(channel));
        state.online
    }

    pub(crate) fn detach_channel(&self, channel: &LoopbackChannel) {
        self.state
            .lock()
            .channels
            .retain(|w| w.upgrade().is_some_and(|c| !std::ptr::eq(Arc::as_ptr(&c), channel)));
    }

    /// Register a monitor and queue the current value as its first element.
    pub(crate) fn start_monitor(&self, monitor: &Arc<LoopbackMonitor>) {
        let mut state = self.state.lock();
        state.monitors.retain(|w| w.strong_count() > 0);
        if !state
            .monitors
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(monitor)))
        {
            state.monitors.push(Arc::downgrade(monitor));
        }
        monitor.push(&state.value, &BitSet::whole());
    }

    pub(crate) fn detach_monitor(&self, monitor: &LoopbackMonitor) {
        self.state
            .lock()
            .monitors
            .retain(|w| !std::ptr::eq(w.as_ptr(), monitor) && w.strong_count() > 0);
    }

    /// Flip the online flag; returns the attached channels to notify.
    pub(crate) fn set_online(&self, online: bool) -> Vec<Arc<LoopbackChannel>> {
        let mut state = self.state.lock();
        state.online = online;
        state.channels.iter().filter_map(Weak::upgrade).collect()
    }

    /// Detach everything; returns the channels and monitors to notify.
    pub(crate) fn take_links(&self) -> (Vec<Arc<LoopbackChannel>>, Vec<Arc<LoopbackMonitor>>) {
        let mut state = self.state.lock();
        let channels = state.channels.drain(..).filter_map(|w| w.upgrade()).collect();
        let monitors = state.monitors.drain(..).filter_map(|w| w.upgrade()).collect();
        (channels, monitors)
    }
}

fn assign(
    target: &mut PvStructure,
    path: &str,
    field: &PvField,
    changed: &mut BitSet,
) -> Result<(), Error> {
    let offset = target
        .offset_of(path)
        .ok_or_else(|| Error::FieldNotFound(path.to_owned()))?;
    let dst = target
        .field_mut(path)
        .ok_or_else(|| Error::FieldNotFound(path.to_owned()))?;
    *dst = convert_field(field, dst)?;
    changed.set(offset);
    Ok(())
}

fn touch_time_stamp(value: &mut PvStructure, changed: &mut BitSet) {
    let Some(offset) = value.offset_of("timeStamp") else {
        return;
    };
    if let Some(PvField::Structure(ts)) = value.field_mut("timeStamp") {
        let now = TimeStamp::now().to_structure();
        if ts.copy_from(&now).is_ok() {
            changed.set(offset);
        }
    }
}

fn notify_monitors(state: &mut RecordState, changed: &BitSet) {
    state.monitors.retain(|w| w.strong_count() > 0);
    for monitor in state.monitors.iter().filter_map(Weak::upgrade) {
        monitor.push(&state.value, changed);
    }
}

// ── Database ─────────────────────────────────────────────────────

/// Name → record map plus channels still searching for a record.
#[derive(Default)]
pub(crate) struct Database {
    records: Mutex<HashMap<String, Arc<Record>>>,
    searching: Mutex<HashMap<String, Vec<Weak<LoopbackChannel>>>>,
}

impl Database {
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Record>> {
        self.records.lock().get(name).cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert a record and attach every channel that was searching for it.
    pub(crate) fn insert(&self, record: Record) -> Result<(), Error> {
        let record = Arc::new(record);
        {
            let mut records = self.records.lock();
            if records.contains_key(record.name()) {
                return Err(Error::RecordExists(record.name().to_owned()));
            }
            records.insert(record.name().to_owned(), Arc::clone(&record));
        }
        let waiting = self
            .searching
            .lock()
            .remove(record.name())
            .unwrap_or_default();
        for channel in waiting.iter().filter_map(Weak::upgrade) {
            channel.attach(&record);
        }
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Result<(), Error> {
        let record = self
            .records
            .lock()
            .remove(name)
            .ok_or_else(|| Error::RecordNotFound(name.to_owned()))?;
        let (channels, monitors) = record.take_links();
        for monitor in monitors {
            monitor.unlisten();
        }
        for channel in channels {
            channel.record_lost();
            self.search(&channel);
        }
        debug!(record = %name, "record removed");
        Ok(())
    }

    /// Attach a channel to its record, or park it until one appears.
    pub(crate) fn search(&self, channel: &Arc<LoopbackChannel>) {
        if let Some(record) = self.get(channel.name_str()) {
            channel.attach(&record);
            return;
        }
        let mut searching = self.searching.lock();
        let list = searching.entry(channel.name_str().to_owned()).or_default();
        list.retain(|w| w.strong_count() > 0);
        list.push(Arc::downgrade(channel));
    }
}
