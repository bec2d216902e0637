use std::sync::Arc;

use pvac_api::{PvField, PvRequest, PvStructure, Scalar, Status, convert_field};
use tracing::debug;

use super::join::{Slot, join};
use super::{Fanout, JoinMode, Members, MultiChannel};
use crate::config::wait_limit;
use crate::data::{PutData, ValueView};
use crate::error::CoreError;
use crate::request::ClientPut;

const OPERATION: &str = "multiPut";

/// One put fanned out across a multi-channel set.
///
/// Staging is all-or-nothing: every connected channel's new value is
/// converted before any channel's put data is touched, so one
/// incompatible channel aborts the whole put.
pub struct MultiPut {
    multi: MultiChannel,
    request: PvRequest,
    mode: JoinMode,
    fanout: Arc<Fanout>,
    puts: Members<ClientPut>,
}

impl MultiPut {
    pub(crate) fn new(multi: MultiChannel, request: PvRequest, mode: JoinMode) -> Self {
        let n = multi.len();
        Self {
            multi,
            request,
            mode,
            fanout: Fanout::new(n),
            puts: Members::new(n),
        }
    }

    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    /// Create and connect the per-channel puts of every connected channel.
    pub fn connect(&self) -> Result<(), CoreError> {
        self.live()?;
        for index in self.connected_indices() {
            self.put_for(index)?;
        }
        Ok(())
    }

    // ── Staging ──────────────────────────────────────────────────

    /// Stage `values[i]` as channel `i`'s value.
    pub fn set_double_array(&self, values: &[f64]) -> Result<(), CoreError> {
        self.live()?;
        if values.len() != self.multi.len() {
            return Err(CoreError::ArrayLength {
                expected: self.multi.len(),
                found: values.len(),
            });
        }
        let fields = values
            .iter()
            .map(|&v| Some(PvField::Scalar(Scalar::Double(v))))
            .collect::<Vec<_>>();
        self.stage(&fields)
    }

    /// Stage the values of an NTMultiChannel structure, one union slot
    /// per channel. Empty slots leave the channel untouched.
    pub fn set_joined(&self, joined: &PvStructure) -> Result<(), CoreError> {
        self.live()?;
        if self.mode != JoinMode::NtMultiChannel {
            return Err(self.illegal("joined put needs NtMultiChannel mode"));
        }
        let Some(PvField::UnionArray(slots)) = joined.field("value") else {
            return Err(CoreError::TypeMismatch {
                field: "value".into(),
                expected: "any[]".into(),
                found: joined
                    .field("value")
                    .map_or_else(|| "nothing".into(), PvField::type_name),
            });
        };
        if slots.len() != self.multi.len() {
            return Err(CoreError::ArrayLength {
                expected: self.multi.len(),
                found: slots.len(),
            });
        }
        self.stage(slots)
    }

    /// The staged put values as an NTMultiChannel structure.
    pub fn joined_structure(&self) -> Result<PvStructure, CoreError> {
        if self.mode != JoinMode::NtMultiChannel {
            return Err(self.illegal("joined structure needs NtMultiChannel mode"));
        }
        self.connect()?;
        let data = self.put_data()?;
        let names = self.multi.channel_names();
        let connected = self.multi.is_connected();
        let slots: Vec<Slot<'_>> = names
            .iter()
            .zip(connected)
            .zip(data.iter())
            .map(|((name, connected), data)| Slot {
                name,
                connected,
                value: data.as_ref().and_then(|d| d.structure()),
            })
            .collect();
        Ok(join(&slots))
    }

    // ── Put ──────────────────────────────────────────────────────

    pub fn issue_put(&self) -> Result<(), CoreError> {
        self.live()?;
        if self.fanout.is_active() {
            return Err(self.already_active());
        }
        // Connect and fetch first so no get-before-put completion is
        // counted as a put.
        let mut participants = self.multi.is_connected();
        let mut puts = vec![None; participants.len()];
        for (index, participant) in participants.iter_mut().enumerate() {
            if !*participant {
                continue;
            }
            match self.put_for(index).and_then(|put| put.data().map(|_| put)) {
                Ok(put) => puts[index] = Some(put),
                Err(e) => {
                    debug!(index, error = %e, "multi-put skipped channel");
                    *participant = false;
                }
            }
        }
        if !self.fanout.begin(&participants) {
            return Err(self.already_active());
        }
        for (index, put) in puts.into_iter().enumerate() {
            let Some(put) = put else {
                continue;
            };
            if let Err(e) = put.issue_put() {
                debug!(index, error = %e, "multi-put issue failed");
                self.fanout.fail(index, Status::error(e.to_string()));
                self.fanout.exclude(index);
            }
        }
        Ok(())
    }

    pub fn wait_put(&self) -> Result<Status, CoreError> {
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
        let puts = self.puts.snapshot();
        let mut failure = outcome.failure;
        for (index, put) in puts.iter().enumerate() {
            if let (true, Some(put)) = (outcome.participants[index], put) {
                let status = put.wait_put()?;
                if !status.is_ok() && failure.is_none() {
                    failure = Some((index, status));
                }
            }
        }
        Ok(match failure {
            Some((index, status)) => Status::error(format!(
                "{}: {}",
                self.multi.channels()[index].name(),
                status
            )),
            None => Status::ok(),
        })
    }

    pub fn put(&self) -> Result<(), CoreError> {
        self.issue_put()?;
        let status = self.wait_put()?;
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

    pub fn put_double_array(&self, values: &[f64]) -> Result<(), CoreError> {
        self.set_double_array(values)?;
        self.put()
    }

    pub fn put_joined(&self, joined: &PvStructure) -> Result<(), CoreError> {
        self.set_joined(joined)?;
        self.put()
    }

    /// Destroy every per-channel put. Every later operation fails.
    /// Idempotent.
    pub fn destroy(&self) {
        if self.puts.destroy() {
            self.fanout.cancel();
            debug!(channels = self.multi.len(), "multi-put destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.puts.is_destroyed()
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Convert every connected channel's new value, then write them all.
    fn stage(&self, fields: &[Option<PvField>]) -> Result<(), CoreError> {
        let mut staged = Vec::new();
        for index in self.connected_indices() {
            let Some(field) = &fields[index] else {
                continue;
            };
            let put = self.put_for(index)?;
            let data = put.data()?;
            let target = data.value()?;
            let converted =
                convert_field(field, target).map_err(|e| CoreError::IncompatibleType {
                    index,
                    channel: self.multi.channels()[index].name().to_owned(),
                    reason: e.to_string(),
                })?;
            staged.push((put, converted));
        }
        for (put, converted) in staged {
            put.update(|data| data.put_field("value", converted))?;
        }
        Ok(())
    }

    fn put_data(&self) -> Result<Vec<Option<PutData>>, CoreError> {
        let puts = self.puts.snapshot();
        puts.iter()
            .map(|put| put.as_ref().map(|p| p.data()).transpose())
            .collect()
    }

    fn put_for(&self, index: usize) -> Result<Arc<ClientPut>, CoreError> {
        if let Some(put) = self.puts.get(index) {
            return Ok(put);
        }
        let channel = &self.multi.channels()[index];
        let put = ClientPut::with_listener(
            channel,
            self.request.clone(),
            Some(self.fanout.listener(index)),
        );
        if let Err(e) = put.connect() {
            put.destroy();
            return Err(e);
        }
        self.puts
            .store(index, put)
            .ok_or_else(|| self.destroyed_error())
    }

    fn live(&self) -> Result<(), CoreError> {
        if self.puts.is_destroyed() {
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

    fn connected_indices(&self) -> Vec<usize> {
        self.multi
            .is_connected()
            .into_iter()
            .enumerate()
            .filter_map(|(i, c)| c.then_some(i))
            .collect()
    }

    fn already_active(&self) -> CoreError {
        CoreError::AlreadyActive {
            channel: self.label(),
            operation: OPERATION.into(),
        }
    }

    fn label(&self) -> String {
        format!("{} channels", self.multi.len())
    }

    fn illegal(&self, reason: &str) -> CoreError {
        CoreError::IllegalState {
            channel: self.label(),
            operation: OPERATION.into(),
            reason: reason.into(),
        }
    }
}
