use std::sync::Arc;

use parking_lot::Mutex;
use pvac_api::{PvRequest, PvStructure, Status};
use tracing::debug;

use super::join::{Slot, join};
use super::{Fanout, JoinMode, Members, MultiChannel};
use crate::config::wait_limit;
use crate::data::{GetData, ValueView};
use crate::error::CoreError;
use crate::request::ClientGet;

const OPERATION: &str = "multiGet";

/// One get fanned out across a multi-channel set.
///
/// Only channels connected at issue time take part; the others report
/// NaN in [`double_array`](Self::double_array) and an empty slot in
/// [`joined_structure`](Self::joined_structure).
pub struct MultiGet {
    multi: MultiChannel,
    request: PvRequest,
    mode: JoinMode,
    fanout: Arc<Fanout>,
    gets: Members<ClientGet>,
    /// Data from the last completed get, by index.
    results: Mutex<Vec<Option<GetData>>>,
}

impl MultiGet {
    pub(crate) fn new(multi: MultiChannel, request: PvRequest, mode: JoinMode) -> Self {
        let n = multi.len();
        Self {
            multi,
            request,
            mode,
            fanout: Fanout::new(n),
            gets: Members::new(n),
            results: Mutex::new(vec![None; n]),
        }
    }

    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    /// Create and connect the per-channel gets of every connected channel.
    pub fn connect(&self) -> Result<(), CoreError> {
        self.live()?;
        for (index, connected) in self.multi.is_connected().into_iter().enumerate() {
            if connected {
                self.get_for(index)?;
            }
        }
        Ok(())
    }

    /// Issue a get on every currently connected channel.
    pub fn issue_get(&self) -> Result<(), CoreError> {
        self.live()?;
        let participants = self.multi.is_connected();
        if !self.fanout.begin(&participants) {
            return Err(CoreError::AlreadyActive {
                channel: self.label(),
                operation: OPERATION.into(),
            });
        }
        for (index, _) in participants.iter().enumerate().filter(|(_, p)| **p) {
            let issued = self.get_for(index).and_then(|get| get.issue_get());
            if let Err(e) = issued {
                debug!(index, error = %e, "multi-get skipped channel");
                self.fanout.exclude(index);
            }
        }
        Ok(())
    }

    /// Wait for every participating channel to report.
    ///
    /// Returns the first failed status, or OK.
    pub fn wait_get(&self) -> Result<Status, CoreError> {
        self.live()?;
        let timeout = wait_limit(self.multi.config().operation_timeout);
        let outcome = self.fanout.wait(timeout);
        self.live()?;
        if !outcome.finished {
            return Ok(Status::timeout(
                OPERATION,
                timeout.unwrap_or_default().as_secs_f64(),
            ));
        }
        let gets = self.gets.snapshot();
        let mut results = self.results.lock();
        for (index, slot) in results.iter_mut().enumerate() {
            *slot = None;
            if !outcome.participants[index] {
                continue;
            }
            let Some(get) = &gets[index] else {
                continue;
            };
            if get.wait_get()?.is_ok() {
                *slot = Some(get.data()?);
            }
        }
        Ok(match outcome.failure {
            Some((index, status)) => Status::error(format!(
                "{}: {}",
                self.multi.channels()[index].name(),
                status
            )),
            None => Status::ok(),
        })
    }

    pub fn get(&self) -> Result<(), CoreError> {
        self.issue_get()?;
        let status = self.wait_get()?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(CoreError::OperationFailed {
                channel: self.label(),
                operation: OPERATION.into(),
                status,
            })
        }
    }

    /// Channel values as doubles; NaN where a channel gave none.
    pub fn double_array(&self) -> Vec<f64> {
        self.results
            .lock()
            .iter()
            .map(|data| {
                data.as_ref()
                    .and_then(|d| d.get_double().ok())
                    .unwrap_or(f64::NAN)
            })
            .collect()
    }

    /// The NTMultiChannel view of the last get.
    pub fn joined_structure(&self) -> Result<PvStructure, CoreError> {
        if self.mode != JoinMode::NtMultiChannel {
            return Err(CoreError::IllegalState {
                channel: self.label(),
                operation: OPERATION.into(),
                reason: "joined structure needs NtMultiChannel mode".into(),
            });
        }
        let names = self.multi.channel_names();
        let connected = self.multi.is_connected();
        let results = self.results.lock();
        let slots: Vec<Slot<'_>> = names
            .iter()
            .zip(connected)
            .zip(results.iter())
            .map(|((name, connected), data)| Slot {
                name,
                connected,
                value: data.as_ref().and_then(|d| d.structure()),
            })
            .collect();
        Ok(join(&slots))
    }

    /// Data of channel `index` from the last get.
    pub fn data(&self, index: usize) -> Option<GetData> {
        self.results.lock().get(index).cloned().flatten()
    }

    /// Destroy every per-channel get. Every later operation fails.
    /// Idempotent.
    pub fn destroy(&self) {
        if self.gets.destroy() {
            self.fanout.cancel();
            debug!(channels = self.multi.len(), "multi-get destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.gets.is_destroyed()
    }

    fn live(&self) -> Result<(), CoreError> {
        if self.gets.is_destroyed() {
            return Err(self.destroyed_error());
        }
        if self.multi.is_destroyed() {
            return Err(self.multi.destroyed_error());
        }
        Ok(())
    }

    fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: self.label(),
            operation: OPERATION.into(),
        }
    }

    fn label(&self) -> String {
        format!("{} channels", self.multi.len())
    }

    fn get_for(&self, index: usize) -> Result<Arc<ClientGet>, CoreError> {
        if let Some(get) = self.gets.get(index) {
            return Ok(get);
        }
        let channel = &self.multi.channels()[index];
        let get = ClientGet::with_listener(
            channel,
            self.request.clone(),
            Some(self.fanout.listener(index)),
        );
        if let Err(e) = get.connect() {
            get.destroy();
            return Err(e);
        }
        self.gets
            .store(index, get)
            .ok_or_else(|| self.destroyed_error())
    }
}
