//! The continuity ledger: extraction, callbacks, compression, assembly, seeding

mod assembler;
pub mod callbacks;
mod compress;
mod entry;
mod extractor;
mod seeder;

pub use assembler::{AssembledContext, ContextAssembler};
pub use callbacks::{Callback, CallbackStatus};
pub use compress::{Compressor, COMPRESSION_PROMPT};
pub use entry::{
    estimate_tokens, CharacterProfile, CharacterState, LedgerEntry, RelationshipShift, Roster,
    ShiftDirection,
};
pub use extractor::LedgerExtractor;
pub use seeder::{CrossBookSeeder, SeedBlock, SeedSource};
