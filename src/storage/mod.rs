// Local document store for settings, works, prompts and creative map items

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::generation::CredentialResolver;
use crate::models::{
    CreativeMapItem, CreativeMapType, NewPrompt, NewWork, Prompt, PromptType, Work,
};

pub const API_KEY_SETTING: &str = "zhixia_api_key";

const SETTINGS_FILE: &str = "settings.json";
const WORKS_FILE: &str = "works.json";
const PROMPTS_FILE: &str = "prompts.json";
const CREATIVE_FILE: &str = "creativemap.json";
const NAVIGATION_FILE: &str = "navigation.json";

/// Records keyed by an auto-assigned id.
#[derive(Debug, Serialize, Deserialize)]
struct Table<T> {
    next_id: u64,
    records: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: Vec::new(),
        }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NavigationState {
    visited: bool,
}

#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn new() -> Result<Self> {
        let data_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("zhixia")
            .join("data");
        Self::at(data_dir)
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn read<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {file}"))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {file}"))
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let content =
            serde_json::to_string_pretty(value).with_context(|| format!("Failed to serialize {file}"))?;
        fs::write(self.data_dir.join(file), content)
            .with_context(|| format!("Failed to write {file}"))?;
        tracing::debug!(file, "store written");
        Ok(())
    }

    // settings

    pub fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut settings: BTreeMap<String, serde_json::Value> = self.read(SETTINGS_FILE)?;
        Ok(settings.remove(key))
    }

    pub fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut settings: BTreeMap<String, serde_json::Value> = self.read(SETTINGS_FILE)?;
        settings.insert(key.to_string(), value);
        self.write(SETTINGS_FILE, &settings)
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let mut settings: BTreeMap<String, serde_json::Value> = self.read(SETTINGS_FILE)?;
        if settings.remove(key).is_some() {
            self.write(SETTINGS_FILE, &settings)?;
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<Option<String>> {
        Ok(self
            .get_setting(API_KEY_SETTING)?
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|key| !key.is_empty()))
    }

    pub fn save_api_key(&self, api_key: &str) -> Result<()> {
        self.put_setting(API_KEY_SETTING, serde_json::Value::String(api_key.trim().to_string()))
    }

    // works

    pub fn add_work(&self, new: NewWork) -> Result<Work> {
        let mut table: Table<Work> = self.read(WORKS_FILE)?;
        let now = Utc::now();
        let work = Work {
            id: table.allocate_id(),
            title: new.title,
            description: new.description,
            work_type: new.work_type,
            content: new.content,
            created_at: now,
            updated_at: now,
        };
        table.records.push(work.clone());
        self.write(WORKS_FILE, &table)?;
        Ok(work)
    }

    pub fn get_work(&self, id: u64) -> Result<Option<Work>> {
        let table: Table<Work> = self.read(WORKS_FILE)?;
        Ok(table.records.into_iter().find(|w| w.id == id))
    }

    pub fn update_work(&self, work: &Work) -> Result<()> {
        let mut table: Table<Work> = self.read(WORKS_FILE)?;
        let slot = table
            .records
            .iter_mut()
            .find(|w| w.id == work.id)
            .ok_or_else(|| anyhow::anyhow!("Work {} not found", work.id))?;
        *slot = Work {
            updated_at: Utc::now(),
            ..work.clone()
        };
        self.write(WORKS_FILE, &table)
    }

    pub fn delete_work(&self, id: u64) -> Result<()> {
        let mut table: Table<Work> = self.read(WORKS_FILE)?;
        let before = table.records.len();
        table.records.retain(|w| w.id != id);
        if table.records.len() != before {
            self.write(WORKS_FILE, &table)?;
        }
        Ok(())
    }

    /// All works, most recently updated first.
    pub fn list_works(&self) -> Result<Vec<Work>> {
        let mut works = self.read::<Table<Work>>(WORKS_FILE)?.records;
        works.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(works)
    }

    // prompts

    pub fn add_prompt(&self, new: NewPrompt) -> Result<Prompt> {
        let mut table: Table<Prompt> = self.read(PROMPTS_FILE)?;
        let now = Utc::now();
        let prompt = Prompt {
            id: table.allocate_id(),
            title: new.title,
            prompt_type: new.prompt_type,
            content: new.content,
            description: new.description,
            examples: new.examples,
            created_at: now,
            updated_at: now,
        };
        table.records.push(prompt.clone());
        self.write(PROMPTS_FILE, &table)?;
        Ok(prompt)
    }

    pub fn get_prompt(&self, id: u64) -> Result<Option<Prompt>> {
        let table: Table<Prompt> = self.read(PROMPTS_FILE)?;
        Ok(table.records.into_iter().find(|p| p.id == id))
    }

    /// A saved prompt that must belong to `prompt_type`.
    pub fn get_prompt_of_type(&self, id: u64, prompt_type: PromptType) -> Result<Prompt> {
        let prompt = self
            .get_prompt(id)?
            .ok_or_else(|| anyhow::anyhow!("Prompt {id} not found"))?;
        if prompt.prompt_type != prompt_type {
            anyhow::bail!(
                "Prompt {id} is a {} prompt, expected {}",
                prompt.prompt_type.as_str(),
                prompt_type.as_str()
            );
        }
        Ok(prompt)
    }

    pub fn update_prompt(&self, prompt: &Prompt) -> Result<()> {
        let mut table: Table<Prompt> = self.read(PROMPTS_FILE)?;
        let slot = table
            .records
            .iter_mut()
            .find(|p| p.id == prompt.id)
            .ok_or_else(|| anyhow::anyhow!("Prompt {} not found", prompt.id))?;
        *slot = Prompt {
            updated_at: Utc::now(),
            ..prompt.clone()
        };
        self.write(PROMPTS_FILE, &table)
    }

    pub fn delete_prompt(&self, id: u64) -> Result<()> {
        let mut table: Table<Prompt> = self.read(PROMPTS_FILE)?;
        let before = table.records.len();
        table.records.retain(|p| p.id != id);
        if table.records.len() != before {
            self.write(PROMPTS_FILE, &table)?;
        }
        Ok(())
    }

    pub fn list_prompts(&self) -> Result<Vec<Prompt>> {
        Ok(self.read::<Table<Prompt>>(PROMPTS_FILE)?.records)
    }

    pub fn list_prompts_by_type(&self, prompt_type: PromptType) -> Result<Vec<Prompt>> {
        Ok(self
            .list_prompts()?
            .into_iter()
            .filter(|p| p.prompt_type == prompt_type)
            .collect())
    }

    // creative map

    pub fn add_creative_item(
        &self,
        item_type: CreativeMapType,
        title: String,
        content: String,
    ) -> Result<CreativeMapItem> {
        let mut items: Vec<CreativeMapItem> = self.read(CREATIVE_FILE)?;
        let mut item = CreativeMapItem::new(item_type, title, content);
        // ids are millisecond stamps; bump on collision within the same millisecond
        let mut stamp = item.created_at.timestamp_millis();
        while items.iter().any(|existing| existing.id == item.id) {
            stamp += 1;
            item.id = format!("{}_{stamp}", item_type.as_str());
        }
        items.push(item.clone());
        self.write(CREATIVE_FILE, &items)?;
        Ok(item)
    }

    pub fn get_creative_item(&self, id: &str) -> Result<Option<CreativeMapItem>> {
        let items: Vec<CreativeMapItem> = self.read(CREATIVE_FILE)?;
        Ok(items.into_iter().find(|item| item.id == id))
    }

    pub fn update_creative_item(&self, item: &CreativeMapItem) -> Result<()> {
        let mut items: Vec<CreativeMapItem> = self.read(CREATIVE_FILE)?;
        let slot = items
            .iter_mut()
            .find(|existing| existing.id == item.id)
            .ok_or_else(|| anyhow::anyhow!("Creative map item {} not found", item.id))?;
        *slot = CreativeMapItem {
            updated_at: Utc::now(),
            ..item.clone()
        };
        self.write(CREATIVE_FILE, &items)
    }

    pub fn delete_creative_item(&self, id: &str) -> Result<()> {
        let mut items: Vec<CreativeMapItem> = self.read(CREATIVE_FILE)?;
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() != before {
            self.write(CREATIVE_FILE, &items)?;
        }
        Ok(())
    }

    /// Items of one type, newest first.
    pub fn list_creative_items(&self, item_type: CreativeMapType) -> Result<Vec<CreativeMapItem>> {
        let mut items: Vec<CreativeMapItem> = self
            .read::<Vec<CreativeMapItem>>(CREATIVE_FILE)?
            .into_iter()
            .filter(|item| item.item_type == item_type)
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    // navigation

    pub fn has_visited(&self) -> Result<bool> {
        Ok(self.read::<NavigationState>(NAVIGATION_FILE)?.visited)
    }

    pub fn mark_visited(&self) -> Result<()> {
        self.write(NAVIGATION_FILE, &NavigationState { visited: true })
    }
}

impl CredentialResolver for Storage {
    fn resolve(&self) -> Result<Option<String>> {
        self.api_key()
    }
}
