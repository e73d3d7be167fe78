//! Conversation summaries.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_transport::Frame;

/// Callback invoked once per completed exchange.
pub type ConversationObserver = Arc<dyn Fn(&ConversationSummary) + Send + Sync>;

/// Which side of an exchange a summary was recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Perspective {
    /// The side that sent the request.
    Requester,
    /// The side that handled the request.
    Responder,
}

/// A frame exchanged in response to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame {
    /// The frame.
    pub frame: Frame,
    /// Time since the request was issued (or received, for the responder).
    pub elapsed: Duration,
}

/// Record of one request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    /// Side the summary was recorded on.
    pub perspective: Perspective,
    /// The initiating frame.
    pub request: Frame,
    /// Response frames, in the order they were sent or received.
    pub responses: Vec<TimedFrame>,
}

/// Builds a summary incrementally and emits it once, when dropped.
pub(crate) struct ConversationRecorder {
    started: Instant,
    observer: Option<ConversationObserver>,
    summary: Option<ConversationSummary>,
}

impl ConversationRecorder {
    pub(crate) fn new(
        perspective: Perspective,
        request: &Frame,
        observer: Option<ConversationObserver>,
    ) -> Self {
        // Frames are only cloned when someone is listening.
        let summary = observer.as_ref().map(|_| ConversationSummary {
            perspective,
            request: request.clone(),
            responses: Vec::new(),
        });
        Self {
            started: Instant::now(),
            observer,
            summary,
        }
    }

    pub(crate) fn record(&mut self, frame: &Frame) {
        if let Some(summary) = self.summary.as_mut() {
            summary.responses.push(TimedFrame {
                frame: frame.clone(),
                elapsed: self.started.elapsed(),
            });
        }
    }
}

impl Drop for ConversationRecorder {
    fn drop(&mut self) {
        if let (Some(observer), Some(summary)) = (self.observer.take(), self.summary.take()) {
            observer(&summary);
        }
    }
}

impl fmt::Debug for ConversationRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationRecorder")
            .field("started", &self.started)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use tether_transport::Value;
    use uuid::Uuid;

    #[test]
    fn test_summary_emitted_once_on_drop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let observer: ConversationObserver = Arc::new(move |summary| {
            seen_clone.lock().push(summary.clone());
        });

        let source = Uuid::new_v4();
        let request = Frame::send(1, Value::Text("hi".to_string()), source);
        {
            let mut recorder = ConversationRecorder::new(Perspective::Requester, &request, Some(observer));
            recorder.record(&Frame::multi(1, Value::Integer(1.into()), source));
            recorder.record(&Frame::end(1, source));
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].perspective, Perspective::Requester);
        assert_eq!(seen[0].request, request);
        assert_eq!(seen[0].responses.len(), 2);
        assert!(seen[0].responses[0].elapsed <= seen[0].responses[1].elapsed);
    }

    #[test]
    fn test_no_observer_records_nothing() {
        let request = Frame::send(1, Value::Null, Uuid::new_v4());
        let mut recorder = ConversationRecorder::new(Perspective::Responder, &request, None);
        recorder.record(&request);
        assert!(recorder.summary.is_none());
    }
}
