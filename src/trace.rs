//! Call tracing for droidbrew.
use std::fmt::Write;

use log::debug;

use crate::bytecode::Dispatch;
use crate::jit::Tier;
use crate::program::MethodKey;

/// One invocation. `referenced` is the method named by the invoke
/// instruction, `resolved_class` the class whose definition actually ran,
/// which differs from the referenced class for receiver-based dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub depth: usize,
    pub caller: Option<MethodKey>,
    pub referenced: MethodKey,
    pub resolved_class: String,
    pub dispatch: Option<Dispatch>,
    pub tier: Tier,
}

/// Collects `CallRecord`s while recording is on.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    is_recording: bool,
    trace: Vec<CallRecord>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Starts a fresh recording.
    pub fn init(&mut self) {
        self.is_recording = true;
        self.trace.clear();
    }

    pub fn record(&mut self, record: CallRecord) {
        if self.is_recording {
            self.trace.push(record);
        }
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.trace
    }

    /// Stops recording and hands out what was recorded.
    pub fn get_recording(&mut self) -> Vec<CallRecord> {
        self.is_recording = false;
        std::mem::take(&mut self.trace)
    }

    /// Renders the trace one call per line, indented by depth.
    pub fn debug(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(&mut s, "---- {} calls recorded ----", self.trace.len());
        for record in &self.trace {
            let dispatch = match record.dispatch {
                Some(d) => format!("{:?}", d),
                None => "Entry".to_string(),
            };
            let _ = writeln!(
                &mut s,
                "{:indent$}{} [{} -> {}, {:?}]",
                "",
                record.referenced,
                dispatch,
                record.resolved_class,
                record.tier,
                indent = record.depth * 2
            );
        }
        debug!(target: "runtime", "{}", s);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(depth: usize, name: &str) -> CallRecord {
        CallRecord {
            depth,
            caller: None,
            referenced: MethodKey {
                class: "LA;".into(),
                name: name.into(),
                signature: "()V".into(),
            },
            resolved_class: "LB;".into(),
            dispatch: Some(Dispatch::VirtualByReceiverClass),
            tier: Tier::Interpreted,
        }
    }

    #[test]
    fn records_only_while_recording() {
        let mut recorder = TraceRecorder::new();
        recorder.record(record(0, "ignored"));
        assert!(recorder.records().is_empty());
        recorder.init();
        recorder.record(record(0, "f"));
        recorder.record(record(1, "g"));
        let dump = recorder.debug();
        assert!(dump.contains("  LA;->g()V [VirtualByReceiverClass -> LB;, Interpreted]"));
        let recording = recorder.get_recording();
        assert_eq!(recording.len(), 2);
        assert!(!recorder.is_recording());
        assert!(recorder.records().is_empty());
    }
}
