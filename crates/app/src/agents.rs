use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::model::GeneralConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("unknown agent type: {0}")]
    UnknownRole(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AgentRole {
    Manager,
    Coder,
    Websearch,
    Consolidator,
    Creative,
    Analyst,
}

/// Which configured model file a role runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSlot {
    Chat,
    Instruct,
    Code,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Assistant,
    DocumentQa,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Manager,
        AgentRole::Coder,
        AgentRole::Websearch,
        AgentRole::Consolidator,
        AgentRole::Creative,
        AgentRole::Analyst,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Manager => "Manager",
            AgentRole::Coder => "Coder",
            AgentRole::Websearch => "Websearch",
            AgentRole::Consolidator => "Consolidator",
            AgentRole::Creative => "Creative",
            AgentRole::Analyst => "Analyst",
        }
    }

    pub fn model_slot(self) -> ModelSlot {
        match self {
            AgentRole::Coder => ModelSlot::Code,
            AgentRole::Consolidator | AgentRole::Analyst => ModelSlot::Instruct,
            AgentRole::Manager | AgentRole::Websearch | AgentRole::Creative => ModelSlot::Chat,
        }
    }

    pub fn kind(self) -> AgentKind {
        match self {
            AgentRole::Consolidator => AgentKind::DocumentQa,
            _ => AgentKind::Assistant,
        }
    }

    pub fn receives_files(self) -> bool {
        matches!(self, AgentRole::Manager | AgentRole::Consolidator)
    }

    pub fn system_instruction(self) -> &'static str {
        match self {
            AgentRole::Manager => {
                "You are a manager, overseeing and coordinating other agents to achieve goals."
            }
            AgentRole::Coder => "You generate and refine code based on user requirements.",
            AgentRole::Websearch => "You conduct web searches and gather relevant information.",
            AgentRole::Consolidator => "You process large texts and generate concise summaries.",
            AgentRole::Creative => "You generate creative text, such as stories and poems.",
            AgentRole::Analyst => "You analyze input, brainstorm ideas, and plan projects.",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| AgentError::UnknownRole(value.to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerateConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub top_k: u32,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
            top_k: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub kind: AgentKind,
    pub model: PathBuf,
    pub generate: GenerateConfig,
    pub system_instruction: String,
    pub tools: Vec<String>,
    pub files: Vec<PathBuf>,
}

/// One profile per role, in `AgentRole::ALL` order.
pub fn setup_agents(config: &GeneralConfig, tools: &[String], files: &[PathBuf]) -> Vec<AgentProfile> {
    AgentRole::ALL
        .into_iter()
        .map(|role| AgentProfile {
            role,
            kind: role.kind(),
            model: config.model_for(role.model_slot()).to_path_buf(),
            generate: GenerateConfig::default(),
            system_instruction: role.system_instruction().to_owned(),
            tools: tools.to_vec(),
            files: if role.receives_files() {
                files.to_vec()
            } else {
                Vec::new()
            },
        })
        .collect()
}
