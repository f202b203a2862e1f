//! Buffer for frames that receive live updates

use serde_json::Value;

use crate::live::{StreamingFrameAction, StreamingFrameOptions};
use crate::models::DataFrame;

/// A frame kept up to date by a live channel
///
/// Updates are appended to or replace the buffered rows according to the
/// subscription's [`StreamingFrameOptions`], then the buffer is trimmed to
/// `max_length` rows and, when `max_delta` is set, to rows no older than
/// `max_delta` milliseconds before the newest one.
#[derive(Debug, Clone)]
pub struct StreamingFrame {
    frame: DataFrame,
    options: StreamingFrameOptions,
}

impl StreamingFrame {
    /// Start buffering from `seed`
    pub fn new(seed: DataFrame, options: StreamingFrameOptions) -> Self {
        let mut buffer = Self {
            frame: seed,
            options,
        };
        buffer.enforce_limits();
        buffer
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn options(&self) -> &StreamingFrameOptions {
        &self.options
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    /// Merge one update into the buffer
    pub fn push(&mut self, update: DataFrame) {
        if !self.same_schema(&update) {
            // Schema changed: start over from the update, keeping identity
            let ref_id = self.frame.ref_id.take();
            let meta = self.frame.meta.take();
            self.frame = update;
            self.frame.ref_id = self.frame.ref_id.take().or(ref_id);
            self.frame.meta = self.frame.meta.take().or(meta);
            self.enforce_limits();
            return;
        }

        for (field, incoming) in self.frame.fields.iter_mut().zip(update.fields) {
            match self.options.action {
                StreamingFrameAction::Append => field.values.extend(incoming.values),
                StreamingFrameAction::Replace => field.values = incoming.values,
            }
        }
        self.enforce_limits();
    }

    fn same_schema(&self, update: &DataFrame) -> bool {
        self.frame.fields.len() == update.fields.len()
            && self
                .frame
                .fields
                .iter()
                .zip(&update.fields)
                .all(|(a, b)| a.name == b.name)
    }

    fn enforce_limits(&mut self) {
        let len = self.frame.len();
        if len > self.options.max_length {
            self.drop_leading_rows(len - self.options.max_length);
        }

        if let Some(max_delta) = self.options.max_delta {
            if let Some(stale) = self.stale_row_count(max_delta) {
                self.drop_leading_rows(stale);
            }
        }
    }

    /// Rows at the start of the buffer older than `max_delta` before the newest row
    fn stale_row_count(&self, max_delta: i64) -> Option<usize> {
        let times = &self.frame.fields[self.frame.time_field_index()?].values;
        let newest = times.iter().rev().find_map(as_millis)?;
        let cutoff = newest - max_delta as f64;
        Some(
            times
                .iter()
                .take_while(|t| as_millis(t).map_or(true, |t| t < cutoff))
                .count(),
        )
    }

    fn drop_leading_rows(&mut self, n: usize) {
        for field in &mut self.frame.fields {
            let n = n.min(field.values.len());
            field.values.drain(..n);
        }
    }
}

fn as_millis(value: &Value) -> Option<f64> {
    value.as_f64()
}
