//! Build outcome reporting

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Type absent from the registry; entry skipped
    NotFound,
    /// `do_enable: false`; entry skipped
    Disabled,
    Created,
}

/// One builder decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub domain: String,
    pub kind: String,
    pub outcome: Outcome,
    /// Extra context appended to the log line, e.g. `num_classes=40`
    pub detail: Option<String>,
}

impl BuildEvent {
    pub fn new(domain: impl Into<String>, kind: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            domain: domain.into(),
            kind: kind.into(),
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Human-readable log line
    pub fn message(&self) -> String {
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        match self.outcome {
            Outcome::NotFound => format!("✘ {} of type {} does not exist", self.domain, self.kind),
            Outcome::Disabled => format!("✘ {} of type {} is turned OFF", self.domain, self.kind),
            Outcome::Created if self.domain.ends_with("augmentation") => {
                format!("✔ {} of type {} is turned ON{}", self.domain, self.kind, detail)
            }
            Outcome::Created => {
                format!("✔ {} of type {} is CREATED{}", self.domain, self.kind, detail)
            }
        }
    }
}

/// Receives every builder decision
pub trait BuildObserver: Send + Sync {
    fn record(&self, event: BuildEvent);
}

/// Emits each event as a `tracing` info line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BuildObserver for TracingObserver {
    fn record(&self, event: BuildEvent) {
        tracing::info!("{}", event.message());
    }
}

/// Keeps events for later inspection (and still logs them)
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BuildEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    /// Kinds with the given outcome in `domain`, in record order
    pub fn kinds(&self, domain: &str, outcome: Outcome) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.domain == domain && e.outcome == outcome)
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl BuildObserver for RecordingObserver {
    fn record(&self, event: BuildEvent) {
        tracing::debug!("{}", event.message());
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let on = BuildEvent::new("Audio augmentation", "gain", Outcome::Created);
        assert_eq!(on.message(), "✔ Audio augmentation of type gain is turned ON");

        let created = BuildEvent::new("Classifier", "linear", Outcome::Created)
            .with_detail("num_classes=4");
        assert_eq!(
            created.message(),
            "✔ Classifier of type linear is CREATED (num_classes=4)"
        );

        let missing = BuildEvent::new("Callback", "Foo", Outcome::NotFound);
        assert_eq!(missing.message(), "✘ Callback of type Foo does not exist");
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::new();
        observer.record(BuildEvent::new("Loss function", "cross_entropy", Outcome::Created));
        observer.record(BuildEvent::new("Callback", "A", Outcome::Disabled));
        assert_eq!(observer.events().len(), 2);
        assert_eq!(
            observer.kinds("Callback", Outcome::Disabled),
            vec!["A".to_string()]
        );
        observer.clear();
        assert!(observer.events().is_empty());
    }
}
