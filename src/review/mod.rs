//! Voice review and surgical revision of newly produced units

mod reviewer;
mod reviser;

pub use reviewer::{VoiceCheck, VoiceReviewRecord, VoiceReviewer};
pub use reviser::{needs_revision, SurgicalReviser};
