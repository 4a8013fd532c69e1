//! Classifier seam
//!
//! Frame capture, the detection model and OCR live outside the relay. The takt loop only sees
//! the coarse label they reduce a frame to, polled once per tick.

use crate::error::ClassifierError;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Nothing recognisable on screen
    None,
    /// The takt countdown screen is visible
    ScreenOpen,
    /// The countdown reached its end
    CycleComplete,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::None => write!(f, "none"),
            Label::ScreenOpen => write!(f, "screen-open"),
            Label::CycleComplete => write!(f, "cycle-complete"),
        }
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Label::None),
            "open" | "screen" | "screen-open" => Ok(Label::ScreenOpen),
            "complete" | "done" | "cycle-complete" => Ok(Label::CycleComplete),
            other => Err(format!("unknown label '{}'", other)),
        }
    }
}

/// Source of per-tick labels
///
/// `poll` runs synchronously inside a tick and is never interrupted by cancellation.
pub trait Classifier: Send + 'static {
    /// Loads whatever the classifier needs before the first poll
    fn prepare(&mut self) -> Result<(), ClassifierError> {
        Ok(())
    }

    fn poll(&mut self) -> Result<Label, ClassifierError>;

    fn name(&self) -> String;
}

/// Classifier fed by an external producer over a channel
///
/// Used by the host binary to take labels from stdin; any other producer works the same way.
/// An empty channel reads as [`Label::None`].
pub struct LineClassifier {
    source: String,
    labels: mpsc::Receiver<Label>,
    closed: bool,
}

impl LineClassifier {
    pub fn new(source: impl Into<String>, labels: mpsc::Receiver<Label>) -> Self {
        Self {
            source: source.into(),
            labels,
            closed: false,
        }
    }
}

impl Classifier for LineClassifier {
    fn prepare(&mut self) -> Result<(), ClassifierError> {
        if self.labels.is_closed() && self.labels.is_empty() {
            return Err(ClassifierError::ModelMissing(format!(
                "{} has no producer",
                self.source
            )));
        }
        info!("Label source {} ready", self.source);
        Ok(())
    }

    fn poll(&mut self) -> Result<Label, ClassifierError> {
        match self.labels.try_recv() {
            Ok(label) => {
                debug!("Label from {}: {}", self.source, label);
                Ok(label)
            }
            Err(TryRecvError::Empty) => Ok(Label::None),
            Err(TryRecvError::Disconnected) if !self.closed => {
                self.closed = true;
                warn!("Label source {} closed", self.source);
                Err(ClassifierError::SourceClosed)
            }
            Err(TryRecvError::Disconnected) => Ok(Label::None),
        }
    }

    fn name(&self) -> String {
        self.source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_from_operator_input() {
        assert_eq!("open".parse::<Label>().unwrap(), Label::ScreenOpen);
        assert_eq!(" Done\n".parse::<Label>().unwrap(), Label::CycleComplete);
        assert_eq!("".parse::<Label>().unwrap(), Label::None);
        assert!("maybe".parse::<Label>().is_err());
    }

    #[test]
    fn line_classifier_reports_closed_source_once() {
        let (tx, rx) = mpsc::channel(4);
        let mut classifier = LineClassifier::new("stdin", rx);
        assert!(classifier.prepare().is_ok());

        tx.try_send(Label::CycleComplete).unwrap();
        assert_eq!(classifier.poll().unwrap(), Label::CycleComplete);
        assert_eq!(classifier.poll().unwrap(), Label::None);

        drop(tx);
        assert!(matches!(classifier.poll(), Err(ClassifierError::SourceClosed)));
        assert_eq!(classifier.poll().unwrap(), Label::None);
    }

    #[test]
    fn line_classifier_without_producer_is_missing() {
        let (tx, rx) = mpsc::channel::<Label>(1);
        drop(tx);
        let mut classifier = LineClassifier::new("stdin", rx);
        assert!(matches!(
            classifier.prepare(),
            Err(ClassifierError::ModelMissing(_))
        ));
    }
}
