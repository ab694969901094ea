use std::fmt;
use std::sync::Arc;

/// Longest path the proxy will report in an event, in bytes.
pub const MAX_EVENT_PATH: usize = 768;

/// Progress notifications delivered to the embedding application.
///
/// Emitted on the responder thread, in order, for each transaction that
/// touches the tree or moves object data. Paths are absolute, UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    OpenSession,
    CloseSession,
    CreateFile { path: String },
    DeleteFile { path: String },
    CreateFolder { path: String },
    DeleteFolder { path: String },
    RenameFile { path: String, new_path: String },
    RenameFolder { path: String, new_path: String },
    ReadBegin { path: String },
    ReadProgress { offset: u64, size: u64 },
    ReadEnd { path: String },
    WriteBegin { path: String },
    WriteProgress { offset: u64, size: u64 },
    WriteEnd { path: String },
}

/// Destination for [`SessionEvent`]s.
///
/// A single function-object field; the callback must be fast and
/// non-blocking, since it runs inline on the responder thread.
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Option<Arc<dyn Fn(&SessionEvent) + Send + Sync>>,
}

impl EventSink {
    /// Sink that drops every event.
    pub fn disabled() -> Self {
        Self { callback: None }
    }

    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = EventSink::new(move |event| captured.lock().unwrap().push(event.clone()));

        sink.emit(SessionEvent::OpenSession);
        sink.emit(SessionEvent::ReadBegin {
            path: "/a/b".into(),
        });
        sink.emit(SessionEvent::ReadProgress {
            offset: 10,
            size: 20,
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], SessionEvent::OpenSession);
        assert!(matches!(seen[2], SessionEvent::ReadProgress { offset: 10, size: 20 }));
    }

    #[test]
    fn disabled_sink_is_silent() {
        EventSink::disabled().emit(SessionEvent::CloseSession);
    }
}
