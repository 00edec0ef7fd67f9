//! Storyledger - narrative continuity for chapter-by-chapter generation
//!
//! Sits beside a story-generation pipeline to:
//! - Record how each character subjectively experienced each unit
//! - Assemble a bounded, budget-respecting context block for the next unit
//! - Carry final state across books of a series
//! - Review new units for voice consistency and revise them surgically

pub mod config;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod review;
pub mod store;

pub use config::{ContinuityConfig, ModelSettings};
pub use engine::{Engine, ReviewOutcome};
pub use ledger::{
    AssembledContext, Callback, CallbackStatus, CharacterProfile, CharacterState, ContextAssembler,
    Compressor, CrossBookSeeder, LedgerEntry, LedgerExtractor, Roster, SeedBlock,
};
pub use model::{ChatClient, LanguageModel, ModelCaller, ScriptedModel, UsageTally};
pub use review::{SurgicalReviser, VoiceCheck, VoiceReviewRecord, VoiceReviewer};
pub use store::{ContinuityStore, JsonFileStore, MemoryStore, UnitRecord, WorkInfo};

/// Result type for Storyledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in Storyledger
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Character roster not found for work '{0}'")]
    SchemaNotFound(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LedgerError {
    /// Whether this failure may have left the continuity record inconsistent.
    ///
    /// Callers still carry on generating; this only decides how loudly to log.
    pub fn corrupts_record(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
