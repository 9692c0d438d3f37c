use std::collections::HashMap;

use crate::events::GenerationEvent;

/// What the front end shows for one generation slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub is_generating: bool,
    /// Fragments received so far, concatenated in arrival order
    pub result: String,
    /// Dismissible inline error banner
    pub error: Option<String>,
}

impl SlotView {
    /// Reset for a new generation in this slot.
    pub fn start(&mut self) {
        self.is_generating = true;
        self.result.clear();
        self.error = None;
    }

    pub fn handle_event(&mut self, event: GenerationEvent) {
        match event {
            GenerationEvent::Fragment(fragment) => {
                // late fragments after a stop or failure are ignored
                if self.is_generating {
                    self.result.push_str(&fragment);
                }
            }
            GenerationEvent::Completed | GenerationEvent::Cancelled => {
                self.is_generating = false;
            }
            GenerationEvent::Failed(error) => {
                self.is_generating = false;
                self.error = error.user_message().map(str::to_string);
            }
        }
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }
}

#[derive(Debug, Default)]
pub struct App {
    views: HashMap<String, SlotView>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, slot: &str) -> Option<&SlotView> {
        self.views.get(slot)
    }

    pub fn start(&mut self, slot: &str) {
        self.views.entry(slot.to_string()).or_default().start();
    }

    pub fn handle_event(&mut self, slot: &str, event: GenerationEvent) {
        self.views.entry(slot.to_string()).or_default().handle_event(event);
    }

    pub fn is_generating(&self) -> bool {
        self.views.values().any(|view| view.is_generating)
    }

    /// Errors currently shown, by slot.
    pub fn banners(&self) -> Vec<(&str, &str)> {
        let mut banners: Vec<(&str, &str)> = self
            .views
            .iter()
            .filter_map(|(slot, view)| view.error.as_deref().map(|error| (slot.as_str(), error)))
            .collect();
        banners.sort_unstable();
        banners
    }
}
