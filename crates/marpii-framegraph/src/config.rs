///Tunables of a [Framegraph](crate::Framegraph).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramegraphConfig {
    ///Number of attachment slots reserved up front. The table grows past it if needed.
    pub attachment_capacity: usize,
    ///Upper bound of render output images accepted on construction.
    pub maximum_frames_in_flight: usize,
    ///Logs every load/store/layout decision on the trace level.
    pub trace_decisions: bool,
}

impl Default for FramegraphConfig {
    fn default() -> Self {
        FramegraphConfig {
            attachment_capacity: 256,
            maximum_frames_in_flight: 3,
            trace_decisions: false,
        }
    }
}

impl FramegraphConfig {
    pub fn with_attachment_capacity(mut self, capacity: usize) -> Self {
        self.attachment_capacity = capacity;
        self
    }

    pub fn with_maximum_frames_in_flight(mut self, count: usize) -> Self {
        self.maximum_frames_in_flight = count;
        self
    }

    pub fn with_trace_decisions(mut self, trace: bool) -> Self {
        self.trace_decisions = trace;
        self
    }
}
