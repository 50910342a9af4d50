use std::collections::{HashMap, VecDeque};

use super::{Controller, ControllerError, TagResult};

/// One write observed by an `InMemoryController`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagWrite {
    Bool { tag: String, value: bool },
    Text { tag: String, value: String },
}

/// Controller double with scripted reads and a recorded write log.
///
/// Each tag has a queue of scripted read results. Once the queue is empty,
/// reads return the tag's current value, which is the last scripted value or
/// the last boolean written.
#[derive(Debug, Default)]
pub struct InMemoryController {
    scripts: HashMap<String, VecDeque<TagResult<bool>>>,
    values: HashMap<String, bool>,
    writes: Vec<TagWrite>,
    write_failures: HashMap<String, ControllerError>,
    disconnected: Option<String>,
    reads: usize,
}

impl InMemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue boolean read results for `tag`.
    pub fn script(&mut self, tag: &str, values: impl IntoIterator<Item = bool>) -> &mut Self {
        let queue = self.scripts.entry(tag.to_string()).or_default();
        queue.extend(values.into_iter().map(Ok));
        self
    }

    /// Queue a failing read for `tag`.
    pub fn script_error(&mut self, tag: &str, error: ControllerError) -> &mut Self {
        self.scripts
            .entry(tag.to_string())
            .or_default()
            .push_back(Err(error));
        self
    }

    pub fn set_value(&mut self, tag: &str, value: bool) -> &mut Self {
        self.values.insert(tag.to_string(), value);
        self
    }

    /// Make every write to `tag` fail with `error`.
    pub fn fail_writes_to(&mut self, tag: &str, error: ControllerError) -> &mut Self {
        self.write_failures.insert(tag.to_string(), error);
        self
    }

    /// Simulate a dropped link: every later operation is a connectivity error.
    pub fn disconnect(&mut self, reason: &str) {
        self.disconnected = Some(reason.to_string());
    }

    pub fn writes(&self) -> &[TagWrite] {
        &self.writes
    }

    pub fn bool_writes_to(&self, tag: &str) -> Vec<bool> {
        self.writes
            .iter()
            .filter_map(|w| match w {
                TagWrite::Bool { tag: t, value } if t == tag => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    fn check_link(&self) -> TagResult<()> {
        match &self.disconnected {
            Some(reason) => Err(ControllerError::Connectivity(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_write(&self, tag: &str) -> TagResult<()> {
        self.check_link()?;
        match self.write_failures.get(tag) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Controller for InMemoryController {
    fn read_bool(&mut self, tag: &str) -> TagResult<bool> {
        self.check_link()?;
        self.reads += 1;
        if let Some(next) = self.scripts.get_mut(tag).and_then(VecDeque::pop_front) {
            let value = next?;
            self.values.insert(tag.to_string(), value);
            return Ok(value);
        }
        self.values
            .get(tag)
            .copied()
            .ok_or_else(|| ControllerError::tag_io(tag, "tag does not exist"))
    }

    fn write_bool(&mut self, tag: &str, value: bool) -> TagResult<()> {
        self.check_write(tag)?;
        self.values.insert(tag.to_string(), value);
        self.writes.push(TagWrite::Bool {
            tag: tag.to_string(),
            value,
        });
        Ok(())
    }

    fn write_string(&mut self, tag: &str, value: &str) -> TagResult<()> {
        self.check_write(tag)?;
        self.writes.push(TagWrite::Text {
            tag: tag.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_then_current_value() {
        let mut plc = InMemoryController::new();
        plc.script("fault", [false, true]);
        assert_eq!(plc.read_bool("fault"), Ok(false));
        assert_eq!(plc.read_bool("fault"), Ok(true));
        assert_eq!(plc.read_bool("fault"), Ok(true));
        plc.write_bool("fault", false).unwrap();
        assert_eq!(plc.read_bool("fault"), Ok(false));
        assert_eq!(plc.reads(), 4);
    }

    #[test]
    fn unknown_tag_is_tag_error() {
        let mut plc = InMemoryController::new();
        assert!(matches!(plc.read_bool("nope"), Err(ControllerError::TagIo { .. })));
    }

    #[test]
    fn disconnect_fails_everything() {
        let mut plc = InMemoryController::new();
        plc.set_value("fault", false);
        plc.disconnect("cable pulled");
        assert!(plc.read_bool("fault").unwrap_err().is_fatal());
        assert!(plc.write_string("path", "x").unwrap_err().is_fatal());
        assert!(plc.writes().is_empty());
    }
}
