//! Takt detection and relay.
//!
//! The classifier reduces each frame to a [`classifier::Label`], the [`cycle::TaktCycle`]
//! decides what a label means for the current sequence, and the [`engine::TaktRun`] drives
//! both on a fixed tick and turns decisions into commands and events.

pub mod classifier;
pub mod cycle;
pub mod engine;

pub use classifier::{Classifier, Label, LineClassifier};
pub use cycle::{CycleSettings, ScreenState, TaktCycle, Verdict, TAKT_STEPS};
pub use engine::{RunSettings, TaktRun};
