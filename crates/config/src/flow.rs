//! Conversation flow definitions
//!
//! A flow is a set of stages arranged into groups. Each group runs its stages
//! in order and then exits to another group, branches on a recorded outcome,
//! or ends the flow. Definitions are plain data; graph validation happens
//! when the agent builds a runnable flow from them.

use dialogue_core::{FieldValue, OutcomeField};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Complete flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,

    /// Shared rules prepended to every stage's instructions
    #[serde(default)]
    pub preamble: String,

    /// Group the flow starts in
    pub entry: String,

    /// Stage every path must end on
    pub terminal: String,

    /// Turn budget for stages that don't set their own
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,

    pub stages: Vec<StageDefinition>,

    pub groups: Vec<GroupDefinition>,
}

fn default_max_turns() -> u32 {
    4
}

/// One conversational goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,

    pub instructions: String,

    /// Outcome fields this stage records
    #[serde(default)]
    pub fields: Vec<OutcomeField>,

    /// Action performed when the stage is entered
    #[serde(default)]
    pub on_enter: Option<EntryAction>,

    /// Committed user turns before the stage is force-completed
    #[serde(default)]
    pub max_turns: Option<u32>,
}

impl StageDefinition {
    pub fn declares(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.name == field)
    }
}

/// Entry action for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryAction {
    /// Speak a fixed script
    Say { text: String },
    /// One-off generation with an extra instruction
    Generate { instruction: String },
    /// Fixed script personalized with the caller's name when known.
    /// `{name}` in `named` is replaced with the display name.
    Greet { default: String, named: String },
}

impl EntryAction {
    /// Resolve a greeting against the caller's display name
    pub fn personalize(&self, display_name: Option<&str>) -> EntryAction {
        match self {
            EntryAction::Greet { default, named } => {
                let text = match display_name.map(str::trim).filter(|n| !n.is_empty()) {
                    Some(name) => named.replace("{name}", name),
                    None => default.clone(),
                };
                EntryAction::Say { text }
            }
            other => other.clone(),
        }
    }
}

/// Ordered run of stages sharing a summary boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub id: String,

    pub stages: Vec<String>,

    /// Collapse history when leaving this group
    #[serde(default)]
    pub summarize: bool,

    pub exit: GroupExit,
}

/// What happens after a group's last stage completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupExit {
    Next { group: String },
    Branch(BranchDefinition),
    End,
}

/// Two-way branch on a recorded outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDefinition {
    /// Stage whose result is inspected
    pub stage: String,
    pub field: String,
    pub equals: FieldValue,
    /// Group taken when the recorded value matches
    pub then: String,
    /// Group taken otherwise, including when the field was never recorded
    pub otherwise: String,
}

impl FlowDefinition {
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&GroupDefinition> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Load from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_flow_file(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Load from JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_flow_file(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load by extension (`.json`, otherwise YAML)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let flow = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path)?,
            _ => Self::from_yaml_file(path)?,
        };
        tracing::info!(
            flow = %flow.name,
            stages = flow.stages.len(),
            groups = flow.groups.len(),
            path = %path.display(),
            "Loaded flow definition"
        );
        Ok(flow)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn read_flow_file(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn stage(id: &str, instructions: &str, fields: Vec<OutcomeField>) -> StageDefinition {
    StageDefinition {
        id: id.to_string(),
        instructions: instructions.to_string(),
        fields,
        on_enter: None,
        max_turns: None,
    }
}

fn generate(instruction: &str) -> Option<EntryAction> {
    Some(EntryAction::Generate {
        instruction: instruction.to_string(),
    })
}

fn group(id: &str, stages: &[&str], summarize: bool, exit: GroupExit) -> GroupDefinition {
    GroupDefinition {
        id: id.to_string(),
        stages: stages.iter().map(|s| s.to_string()).collect(),
        summarize,
        exit,
    }
}

fn branch(stage: &str, field: &str, then: &str, otherwise: &str) -> GroupExit {
    GroupExit::Branch(BranchDefinition {
        stage: stage.to_string(),
        field: field.to_string(),
        equals: FieldValue::Bool(true),
        then: then.to_string(),
        otherwise: otherwise.to_string(),
    })
}

impl Default for FlowDefinition {
    /// Patient intake call: confirm it is a good time, then either gather
    /// diagnosis and treatment details or schedule a callback.
    fn default() -> Self {
        let mut opening = stage(
            "opening",
            "You already asked whether now is a good time to talk. When they answer, \
             record proceed=true or proceed=false and say one short line to move on.",
            vec![OutcomeField::required(
                "proceed",
                "Whether the caller has time to talk now",
            )],
        );
        opening.on_enter = Some(EntryAction::Greet {
            default: "Hello, I'm calling from the care team about your recent medical test. \
                      Is this a good time to talk?"
                .to_string(),
            named: "Hello, I'm calling from the care team about your recent medical test. \
                    May I speak with {name}?"
                .to_string(),
        });

        let mut schedule_callback = stage(
            "schedule_callback",
            "The caller is busy. Ask when would be a good time to call back and record it.",
            vec![OutcomeField::required(
                "callback_preference",
                "When the caller would like to be called back",
            )],
        );
        schedule_callback.on_enter =
            generate("Politely ask when would be a good time to call them back.");

        let mut confirmation = stage(
            "confirmation",
            "Ask whether they have discussed the report with their doctor. If they have not, \
             do not mention the diagnosis; briefly explain how the care team helps instead.",
            vec![OutcomeField::optional(
                "discussed_with_doctor",
                "Whether the caller has discussed the report with a doctor",
            )],
        );
        confirmation.on_enter = Some(EntryAction::Say {
            text: "I'll need a few details to understand your situation. Have you discussed \
                   the report with your doctor yet?"
                .to_string(),
        });

        let mut diagnosis = stage(
            "diagnosis",
            "Ask about the type and stage of the condition, then whether a biopsy was done. \
             Two questions at most. If they are unsure, acknowledge and ask whether they have \
             started treatment.",
            vec![
                OutcomeField::optional("cancer_type", "Type of cancer, if known"),
                OutcomeField::optional("biopsy_done", "Whether a biopsy has been done"),
                OutcomeField::optional("stage_known", "Whether the stage is known"),
            ],
        );
        diagnosis.on_enter = generate("Ask about the type and stage of the diagnosis.");

        let treatment = stage(
            "treatment",
            "The previous message asked whether treatment has started. Do not ask again. \
             Record started=true or started=false.",
            vec![
                OutcomeField::required("started", "Whether treatment has started"),
                OutcomeField::optional("hospital", "Hospital treating the caller"),
            ],
        );

        let timeline = stage(
            "timeline",
            "Ask when they plan to start or look into treatment and record the answer.",
            vec![OutcomeField::optional(
                "timeline",
                "When the caller plans to start treatment",
            )],
        );

        let mut geography = stage(
            "geography",
            "Ask where they are from, then whether they would travel for treatment if needed. \
             Keep it friendly, not a checklist.",
            vec![
                OutcomeField::optional("where_from", "Caller's city or region"),
                OutcomeField::optional("willing_to_travel", "Willingness to travel"),
            ],
        );
        geography.on_enter = generate("Ask in a friendly way where they are from.");

        let mut closing = stage(
            "closing",
            "This is the closing step. Thank them warmly and wish them well. \
             Signal the stage is done once you have said goodbye.",
            Vec::new(),
        );
        closing.on_enter = generate("Thank them, mention the next steps and say goodbye.");

        Self {
            name: "patient_intake".to_string(),
            preamble: "You are a warm, concise care coordinator on a phone call. Ask one \
                       question per turn. Do not repeat back what the caller said. Output only \
                       the words to speak."
                .to_string(),
            entry: "opening".to_string(),
            terminal: "closing".to_string(),
            default_max_turns: default_max_turns(),
            stages: vec![
                opening,
                schedule_callback,
                confirmation,
                diagnosis,
                treatment,
                timeline,
                geography,
                closing,
            ],
            groups: vec![
                group(
                    "opening",
                    &["opening"],
                    false,
                    branch("opening", "proceed", "intake", "callback"),
                ),
                group(
                    "intake",
                    &["confirmation", "diagnosis", "treatment"],
                    true,
                    branch("treatment", "started", "wrap_up", "planning"),
                ),
                group("wrap_up", &["geography", "closing"], false, GroupExit::End),
                group(
                    "planning",
                    &["timeline", "geography", "closing"],
                    false,
                    GroupExit::End,
                ),
                group(
                    "callback",
                    &["schedule_callback", "closing"],
                    false,
                    GroupExit::End,
                ),
            ],
        }
    }
}
