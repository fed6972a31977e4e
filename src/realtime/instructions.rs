//! Tutor instructions for a practice conversation
//!
//! Turns the learner's setup (class level, target language, topic) into the
//! system instructions carried by `session.update`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::protocol::SessionConfig;

/// Class level the tutor pitches its speech at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProficiencyLevel {
    #[serde(rename = "1-2")]
    Levels1To2,
    #[serde(rename = "3-4")]
    Levels3To4,
    #[serde(rename = "5-6")]
    Levels5To6,
    #[serde(rename = "7-8")]
    Levels7To8,
    #[serde(rename = "ap-language")]
    ApLanguage,
    #[serde(rename = "ap-literature")]
    ApLiterature,
}

impl ProficiencyLevel {
    pub const ALL: [ProficiencyLevel; 6] = [
        ProficiencyLevel::Levels1To2,
        ProficiencyLevel::Levels3To4,
        ProficiencyLevel::Levels5To6,
        ProficiencyLevel::Levels7To8,
        ProficiencyLevel::ApLanguage,
        ProficiencyLevel::ApLiterature,
    ];

    /// Form value, e.g. `"3-4"` or `"ap-language"`
    pub fn key(&self) -> &'static str {
        match self {
            ProficiencyLevel::Levels1To2 => "1-2",
            ProficiencyLevel::Levels3To4 => "3-4",
            ProficiencyLevel::Levels5To6 => "5-6",
            ProficiencyLevel::Levels7To8 => "7-8",
            ProficiencyLevel::ApLanguage => "ap-language",
            ProficiencyLevel::ApLiterature => "ap-literature",
        }
    }

    /// Label shown when picking a level
    pub fn label(&self) -> &'static str {
        match self {
            ProficiencyLevel::Levels1To2 => "Level 1-2",
            ProficiencyLevel::Levels3To4 => "Level 3-4",
            ProficiencyLevel::Levels5To6 => "Level 5-6",
            ProficiencyLevel::Levels7To8 => "Level 7-8 Honors",
            ProficiencyLevel::ApLanguage => "AP Language",
            ProficiencyLevel::ApLiterature => "AP Literature",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProficiencyLevel::Levels1To2 => "Novice Low-High",
            ProficiencyLevel::Levels3To4 => "Intermediate Low-Mid",
            ProficiencyLevel::Levels5To6 => "Intermediate Mid-High",
            ProficiencyLevel::Levels7To8 => "Advanced Low",
            ProficiencyLevel::ApLanguage => "Advanced Mid-High",
            ProficiencyLevel::ApLiterature => "Advanced High-Superior",
        }
    }

    /// How the tutor should speak at this level
    pub fn speaking_guidelines(&self) -> &'static str {
        match self {
            ProficiencyLevel::Levels1To2 => {
                "Speak very slowly and clearly. Use simple, basic vocabulary that would be found \
                 in beginner textbooks. Use short sentences. Emphasize pronunciation of syllables. \
                 Use more formal, academic language. Avoid idioms or colloquialisms."
            }
            ProficiencyLevel::Levels3To4 => {
                "Speak at a moderate pace. Use vocabulary and sentence structures appropriate for \
                 intermediate learners. Ask simple questions and encourage responses. Use everyday \
                 topics and situations."
            }
            ProficiencyLevel::Levels5To6 => {
                "Speak at a normal pace. Use more complex sentence structures and varied \
                 vocabulary. Introduce different time frames in conversation. Connect ideas and \
                 encourage longer responses."
            }
            ProficiencyLevel::Levels7To8 => {
                "Speak at a natural pace. Use advanced vocabulary and complex sentence structures. \
                 Encourage explanations and opinions. Discuss abstract topics and current events."
            }
            ProficiencyLevel::ApLanguage => {
                "Speak at a natural, fluent pace. Use sophisticated vocabulary and advanced \
                 grammar structures. Discuss complex abstract topics. Encourage detailed analysis \
                 and extended discourse."
            }
            ProficiencyLevel::ApLiterature => {
                "Speak naturally with native-like fluency. Use advanced, nuanced vocabulary. \
                 Discuss literature, cultural topics, and complex abstract concepts. Encourage \
                 persuasive arguments and cultural analysis."
            }
        }
    }
}

impl fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Unknown level or language name
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid {kind}: {value}. Valid options are: {valid}")]
pub struct ParseSetupError {
    kind: &'static str,
    value: String,
    valid: String,
}

impl FromStr for ProficiencyLevel {
    type Err = ParseSetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProficiencyLevel::ALL
            .into_iter()
            .find(|level| level.key() == wanted)
            .ok_or_else(|| ParseSetupError {
                kind: "class level",
                value: s.to_string(),
                valid: ProficiencyLevel::ALL.map(|l| l.key()).join(", "),
            })
    }
}

/// Language the learner practices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Spanish,
    French,
    Vietnamese,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::English,
        Language::Spanish,
        Language::French,
        Language::Vietnamese,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Language::English => "english",
            Language::Spanish => "spanish",
            Language::French => "french",
            Language::Vietnamese => "vietnamese",
        }
    }

    /// Tutor voice used for this language
    pub fn voice(&self) -> &'static str {
        match self {
            Language::Spanish => "alloy",
            Language::French => "shimmer",
            Language::Vietnamese => "nova",
            Language::English => "echo",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Spanish => "Spanish",
            Language::French => "French",
            Language::Vietnamese => "Vietnamese",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = ParseSetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|language| language.key() == wanted)
            .ok_or_else(|| ParseSetupError {
                kind: "language",
                value: s.to_string(),
                valid: Language::ALL.map(|l| l.key()).join(", "),
            })
    }
}

/// What the learner picked before starting a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeSetup {
    pub native_language: Language,
    pub learning_language: Language,
    pub class_level: ProficiencyLevel,
    pub conversation_prompt: String,
    /// Free-form grading rubric text, if the instructor provided one
    #[serde(default)]
    pub rubric: Option<String>,
}

/// Compose the tutor's system instructions
pub fn build_instructions(setup: &PracticeSetup) -> String {
    let language = setup.learning_language.name();
    let level = setup.class_level;
    let topic = setup.conversation_prompt.trim();

    let rubric = match setup.rubric.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => {
            "Assess responses based on the provided rubric and adjust complexity accordingly."
        }
        _ => "No rubric provided - use class level as primary guide.",
    };

    format!(
        "You are an AI language tutor helping a student learn {language}.\n\
         \n\
         PROFICIENCY LEVEL: {description}\n\
         SPEAKING GUIDELINES: {guidelines}\n\
         \n\
         CONVERSATION TOPIC: {topic}\n\
         \n\
         RUBRIC CONTEXT: {rubric}\n\
         \n\
         ADAPTIVE BEHAVIOR:\n\
         - Start at the indicated proficiency level\n\
         - Listen carefully to student responses to gauge actual ability\n\
         - If student struggles, simplify language and speak more slowly\n\
         - If student excels, gradually increase complexity and pace\n\
         - Always respond in {language}\n\
         - Provide gentle corrections when needed\n\
         - Keep the conversation engaging and educational\n\
         \n\
         Begin the conversation by greeting the student in {language} and introducing the \
         topic: \"{topic}\"",
        description = level.description(),
        guidelines = level.speaking_guidelines(),
    )
}

impl SessionConfig {
    /// Config for a practice conversation: default audio setup, voice picked
    /// by the learning language
    pub fn for_practice(setup: &PracticeSetup) -> Self {
        SessionConfig::new(build_instructions(setup)).with_voice(setup.learning_language.voice())
    }
}
