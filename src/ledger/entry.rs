//! Ledger entries: per-unit, per-character subjective state

use super::callbacks::Callback;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Approximate characters per token for budget estimation
const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Estimate token count for a string (`ceil(chars / 4)`)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// One unit's continuity record. Unique per `(work_id, unit_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub work_id: String,
    pub unit_index: u32,

    /// Keyed by character name; ordered so rendering is deterministic
    pub character_states: BTreeMap<String, CharacterState>,

    #[serde(default)]
    pub group_dynamics: String,

    /// Merged and pruned callback bank as of this unit
    #[serde(default)]
    pub callback_bank: Vec<Callback>,

    /// Filled lazily once the entry ages out of the recency window
    #[serde(default)]
    pub compressed_summary: Option<String>,

    pub token_estimate: usize,

    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(work_id: impl Into<String>, unit_index: u32) -> Self {
        let mut entry = Self {
            work_id: work_id.into(),
            unit_index,
            character_states: BTreeMap::new(),
            group_dynamics: String::new(),
            callback_bank: Vec::new(),
            compressed_summary: None,
            token_estimate: 0,
            created_at: Utc::now(),
        };
        entry.refresh_token_estimate();
        entry
    }

    pub fn with_character(mut self, name: impl Into<String>, state: CharacterState) -> Self {
        self.character_states.insert(name.into(), state);
        self.refresh_token_estimate();
        self
    }

    pub fn with_group_dynamics(mut self, dynamics: impl Into<String>) -> Self {
        self.group_dynamics = dynamics.into();
        self.refresh_token_estimate();
        self
    }

    pub fn with_callbacks(mut self, callbacks: Vec<Callback>) -> Self {
        self.callback_bank = callbacks;
        self.refresh_token_estimate();
        self
    }

    /// Recompute `token_estimate` from the verbatim rendering.
    pub fn refresh_token_estimate(&mut self) {
        self.token_estimate = estimate_tokens(&self.render_full());
    }

    /// Full-detail rendering of the character states and group dynamics.
    ///
    /// The callback bank is not part of this block; the assembler appends it
    /// once as its own section.
    pub fn render_full(&self) -> String {
        let mut out = String::new();
        for (name, state) in &self.character_states {
            let _ = writeln!(out, "**{}**", name);
            if !state.emotional_state.is_empty() {
                let _ = writeln!(out, "- Emotional state: {}", state.emotional_state);
            }
            if !state.experience_from_pov.is_empty() {
                let _ = writeln!(out, "- Experienced: {}", state.experience_from_pov);
            }
            if !state.new_knowledge.is_empty() {
                let _ = writeln!(out, "- Now knows: {}", state.new_knowledge.join("; "));
            }
            if !state.private_thoughts.is_empty() {
                let _ = writeln!(out, "- Privately: {}", state.private_thoughts);
            }
            for (other, shift) in &state.relationship_shifts {
                let _ = writeln!(
                    out,
                    "- With {}: {}{} {}",
                    other,
                    shift.direction,
                    if shift.unresolved { " (unresolved)" } else { "" },
                    shift.detail
                );
            }
        }
        if !self.group_dynamics.is_empty() {
            let _ = writeln!(out, "Group dynamics: {}", self.group_dynamics);
        }
        out
    }

    /// Every relationship shift still marked unresolved, as `(from, to, shift)`.
    pub fn unresolved_tensions(&self) -> Vec<(&str, &str, &RelationshipShift)> {
        self.character_states
            .iter()
            .flat_map(|(name, state)| {
                state
                    .relationship_shifts
                    .iter()
                    .filter(|(_, shift)| shift.unresolved)
                    .map(move |(other, shift)| (name.as_str(), other.as_str(), shift))
            })
            .collect()
    }
}

/// How one character experienced one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    #[serde(default)]
    pub emotional_state: String,

    #[serde(default)]
    pub experience_from_pov: String,

    #[serde(default)]
    pub new_knowledge: Vec<String>,

    #[serde(default)]
    pub private_thoughts: String,

    #[serde(default)]
    pub relationship_shifts: BTreeMap<String, RelationshipShift>,
}

impl CharacterState {
    pub fn new(emotional_state: impl Into<String>) -> Self {
        Self {
            emotional_state: emotional_state.into(),
            ..Self::default()
        }
    }

    pub fn with_experience(mut self, experience: impl Into<String>) -> Self {
        self.experience_from_pov = experience.into();
        self
    }

    pub fn with_knowledge(mut self, fact: impl Into<String>) -> Self {
        self.new_knowledge.push(fact.into());
        self
    }

    pub fn with_private_thoughts(mut self, thoughts: impl Into<String>) -> Self {
        self.private_thoughts = thoughts.into();
        self
    }

    pub fn with_shift(mut self, other: impl Into<String>, shift: RelationshipShift) -> Self {
        self.relationship_shifts.insert(other.into(), shift);
        self
    }
}

/// Change in one directed relationship during a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipShift {
    pub direction: ShiftDirection,

    #[serde(default)]
    pub detail: String,

    #[serde(default)]
    pub unresolved: bool,
}

impl RelationshipShift {
    pub fn new(direction: ShiftDirection, detail: impl Into<String>) -> Self {
        Self {
            direction,
            detail: detail.into(),
            unresolved: false,
        }
    }

    pub fn unresolved(mut self) -> Self {
        self.unresolved = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftDirection {
    Strengthening,
    Deteriorating,
    Complicated,
    Stable,
}

impl std::fmt::Display for ShiftDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Strengthening => "strengthening",
            Self::Deteriorating => "deteriorating",
            Self::Complicated => "complicated",
            Self::Stable => "stable",
        };
        f.write_str(s)
    }
}

/// Reference data about the cast. Never mutated by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default, alias = "character")]
    pub characters: Vec<CharacterProfile>,
}

impl Roster {
    pub fn new(characters: Vec<CharacterProfile>) -> Self {
        Self { characters }
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Look a character up by name, ignoring ASCII case
    pub fn get(&self, name: &str) -> Option<&CharacterProfile> {
        self.characters
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Parse a roster from TOML (`[[character]]` tables) or JSON.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let trimmed = content.trim_start();
        // TOML rosters open with `[[character]]`; JSON never does
        let looks_like_json =
            trimmed.starts_with('{') || (trimmed.starts_with('[') && !trimmed.starts_with("[["));
        if looks_like_json {
            if let Ok(roster) = serde_json::from_str::<Self>(trimmed) {
                return Ok(roster);
            }
            let characters: Vec<CharacterProfile> = serde_json::from_str(trimmed)?;
            return Ok(Self { characters });
        }
        Ok(toml::from_str(content)?)
    }

    /// Prompt-ready description of the cast
    pub fn to_prompt_string(&self) -> String {
        let mut out = String::new();
        for c in &self.characters {
            let _ = write!(out, "- {}", c.name);
            if !c.personality.is_empty() {
                let _ = write!(out, " | personality: {}", c.personality);
            }
            if !c.motivation.is_empty() {
                let _ = write!(out, " | motivation: {}", c.motivation);
            }
            if let Some(voice) = c.voice.as_deref().filter(|v| !v.is_empty()) {
                let _ = write!(out, " | voice: {}", voice);
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,

    #[serde(default)]
    pub personality: String,

    #[serde(default)]
    pub motivation: String,

    /// Speech patterns, verbal tics, register
    #[serde(default)]
    pub voice: Option<String>,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_motivation(mut self, motivation: impl Into<String>) -> Self {
        self.motivation = motivation.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // Counted in chars, not bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_render_full_is_ordered_by_name() {
        let entry = LedgerEntry::new("w", 1)
            .with_character("Zara", CharacterState::new("wary"))
            .with_character("Abel", CharacterState::new("hopeful"));
        let rendered = entry.render_full();
        let abel = rendered.find("**Abel**").unwrap();
        let zara = rendered.find("**Zara**").unwrap();
        assert!(abel < zara);
        assert_eq!(entry.token_estimate, estimate_tokens(&rendered));
    }

    #[test]
    fn test_unresolved_tensions() {
        let entry = LedgerEntry::new("w", 2).with_character(
            "Mara",
            CharacterState::new("angry")
                .with_shift(
                    "Tobin",
                    RelationshipShift::new(ShiftDirection::Deteriorating, "he lied").unresolved(),
                )
                .with_shift("Ilse", RelationshipShift::new(ShiftDirection::Stable, "")),
        );
        let tensions = entry.unresolved_tensions();
        assert_eq!(tensions.len(), 1);
        assert_eq!(tensions[0].0, "Mara");
        assert_eq!(tensions[0].1, "Tobin");
    }

    #[test]
    fn test_shift_direction_wire_format() {
        let shift: RelationshipShift =
            serde_json::from_str(r#"{"direction":"complicated","detail":"x"}"#).unwrap();
        assert_eq!(shift.direction, ShiftDirection::Complicated);
        assert!(!shift.unresolved);
        assert!(serde_json::from_str::<RelationshipShift>(r#"{"direction":"sideways"}"#).is_err());
    }

    #[test]
    fn test_roster_parse_toml_and_json() {
        let toml_roster = Roster::parse(
            r#"
[[character]]
name = "Mara"
personality = "guarded"

[[character]]
name = "Tobin"
"#,
        )
        .unwrap();
        assert_eq!(toml_roster.characters.len(), 2);
        assert!(toml_roster.contains("mara"));

        let json_roster = Roster::parse(r#"[{"name": "Ilse", "motivation": "revenge"}]"#).unwrap();
        assert_eq!(json_roster.characters[0].motivation, "revenge");

        let wrapped = Roster::parse(r#"{"characters": [{"name": "Ilse"}]}"#).unwrap();
        assert_eq!(wrapped.characters.len(), 1);
    }
}
