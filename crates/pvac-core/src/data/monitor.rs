use pvac_api::{BitSet, MonitorElement, PvStructure};

use super::{ValueView, render_bits};

/// The element currently owned by the client of a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorData {
    channel: String,
    value: Option<PvStructure>,
    changed: BitSet,
    overrun: BitSet,
}

impl MonitorData {
    pub(crate) fn new(channel: &str, shape: Option<PvStructure>) -> Self {
        Self {
            channel: channel.to_owned(),
            value: shape,
            changed: BitSet::new(),
            overrun: BitSet::new(),
        }
    }

    pub(crate) fn update(&mut self, element: &MonitorElement) {
        self.value = Some(element.value.clone());
        self.changed = element.changed.clone();
        self.overrun = element.overrun.clone();
    }

    /// Fields that changed more than once since the previous element.
    pub fn overrun_bitset(&self) -> &BitSet {
        &self.overrun
    }

    pub fn show_overrun(&self) -> String {
        render_bits(self.value.as_ref(), &self.overrun)
    }
}

impl ValueView for MonitorData {
    fn channel_name(&self) -> &str {
        &self.channel
    }

    fn structure(&self) -> Option<&PvStructure> {
        self.value.as_ref()
    }

    fn changed_bitset(&self) -> &BitSet {
        &self.changed
    }
}
