use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chapters::Chapter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Novel,
    Character,
    Worldbuilding,
    Plot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Work {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub work_type: WorkType,
    /// JSON-encoded chapter array; empty when the work has no chapters yet.
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Work {
    pub fn chapters(&self) -> Vec<Chapter> {
        if self.content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str(&self.content) {
            Ok(chapters) => chapters,
            Err(e) => {
                tracing::warn!(work_id = self.id, error = %e, "work content is not a chapter array");
                Vec::new()
            }
        }
    }

    pub fn set_chapters(&mut self, chapters: &[Chapter]) -> serde_json::Result<()> {
        self.content = serde_json::to_string(chapters)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Fields supplied by the caller when creating a work; the store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub title: String,
    pub description: String,
    pub work_type: WorkType,
    pub content: String,
}

impl NewWork {
    pub fn novel(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            work_type: WorkType::Novel,
            content: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Analysis,
    Writing,
    Introduction,
    Outline,
    DetailedOutline,
    Character,
    Worldbuilding,
    Plot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptGroup {
    Novel,
    Creative,
}

impl PromptType {
    pub const ALL: [Self; 8] = [
        Self::Analysis,
        Self::Writing,
        Self::Introduction,
        Self::Outline,
        Self::DetailedOutline,
        Self::Character,
        Self::Worldbuilding,
        Self::Plot,
    ];

    pub const fn group(self) -> PromptGroup {
        match self {
            Self::Analysis | Self::Writing => PromptGroup::Novel,
            _ => PromptGroup::Creative,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Writing => "writing",
            Self::Introduction => "introduction",
            Self::Outline => "outline",
            Self::DetailedOutline => "detailed_outline",
            Self::Character => "character",
            Self::Worldbuilding => "worldbuilding",
            Self::Plot => "plot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prompt {
    pub id: u64,
    pub title: String,
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub title: String,
    pub prompt_type: PromptType,
    pub content: String,
    pub description: String,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CreativeMapType {
    Introduction,
    Outline,
    DetailedOutline,
    Character,
    Worldbuilding,
    Plot,
}

impl CreativeMapType {
    pub const ALL: [Self; 6] = [
        Self::Introduction,
        Self::Outline,
        Self::DetailedOutline,
        Self::Character,
        Self::Worldbuilding,
        Self::Plot,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Introduction => "introduction",
            Self::Outline => "outline",
            Self::DetailedOutline => "detailed_outline",
            Self::Character => "character",
            Self::Worldbuilding => "worldbuilding",
            Self::Plot => "plot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Introduction => "导语生成器",
            Self::Outline => "大纲生成",
            Self::DetailedOutline => "细纲生成",
            Self::Character => "角色设计",
            Self::Worldbuilding => "世界搭建",
            Self::Plot => "情节设计",
        }
    }

    /// Instruction used when the user has not picked a saved prompt.
    pub const fn default_template(self) -> &'static str {
        match self {
            Self::Introduction => "为[类型]的故事创建一个引人入胜的开篇导语，设定[氛围]的基调，并引导读者关注[焦点]。请基于以下要求生成：\n\n",
            Self::Outline => "为[主题]的[类型]故事创建一个大纲，包括主线规划、章节划分和核心情节点。请基于以下要求生成：\n\n",
            Self::DetailedOutline => "基于大纲，为[章节名]创建详细的内容规划，包括场景描述、对话设计和情感氛围。请基于以下要求生成：\n\n",
            Self::Character => "创建一个[性格特点]的角色，包括其背景故事、动机、外貌特征和行为模式。请基于以下要求生成：\n\n",
            Self::Worldbuilding => "设计一个[类型]的世界，包括其[历史/地理/文化/政治]等方面。重点描述[特点]。请基于以下要求生成：\n\n",
            Self::Plot => "",
        }
    }

    pub const fn prompt_type(self) -> PromptType {
        match self {
            Self::Introduction => PromptType::Introduction,
            Self::Outline => PromptType::Outline,
            Self::DetailedOutline => PromptType::DetailedOutline,
            Self::Character => PromptType::Character,
            Self::Worldbuilding => PromptType::Worldbuilding,
            Self::Plot => PromptType::Plot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreativeMapItem {
    /// `<type>_<unix millis>`
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: CreativeMapType,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreativeMapItem {
    pub fn new(item_type: CreativeMapType, title: String, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}_{}", item_type.as_str(), now.timestamp_millis()),
            item_type,
            title,
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

pub const MODEL_FAST: &str = "google/gemini-2.0-flash-thinking-exp:free";
pub const MODEL_PRO: &str = "google/gemini-2.5-pro-exp-03-25:free";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api_base: String,
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub site_name: String,
    #[serde(default = "default_debounce")]
    pub autosave_debounce_ms: u64,
    #[serde(default = "default_grace")]
    pub slot_grace_ms: u64,
}

const fn default_temperature() -> f32 {
    0.7
}

const fn default_max_output_tokens() -> u32 {
    64_000
}

const fn default_timeout() -> u64 {
    600
}

const fn default_debounce() -> u64 {
    2_000
}

const fn default_grace() -> u64 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: "https://openrouter.ai/api/v1".to_string(),
            default_model: MODEL_FAST.to_string(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout: default_timeout(),
            site_url: String::new(),
            site_name: "Zhixia".to_string(),
            autosave_debounce_ms: default_debounce(),
            slot_grace_ms: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub label: String,
    pub max_output_tokens: u32,
}
