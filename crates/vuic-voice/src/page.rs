//! Page context: visible text of the host UI, sent so the processor can refer to it.

use serde::{Deserialize, Serialize};

/// Visible text grouped by element kind. Entries are trimmed, non-empty and unique per group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub buttons: Vec<String>,
    pub links: Vec<String>,
    pub paragraphs: Vec<String>,
    pub headers: Vec<String>,
    pub others: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Button,
    Link,
    Paragraph,
    Header,
    Other,
}

impl PageContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `text` under `kind`, skipping blanks and repeats.
    pub fn push(&mut self, kind: TextKind, text: &str) -> &mut Self {
        let text = text.trim();
        if text.is_empty() {
            return self;
        }
        let group = match kind {
            TextKind::Button => &mut self.buttons,
            TextKind::Link => &mut self.links,
            TextKind::Paragraph => &mut self.paragraphs,
            TextKind::Header => &mut self.headers,
            TextKind::Other => &mut self.others,
        };
        if !group.iter().any(|existing| existing == text) {
            group.push(text.to_string());
        }
        self
    }

    pub fn with(mut self, kind: TextKind, text: &str) -> Self {
        self.push(kind, text);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
            && self.links.is_empty()
            && self.paragraphs.is_empty()
            && self.headers.is_empty()
            && self.others.is_empty()
    }
}

/// Supplies a snapshot of the host UI's text.
pub trait PageContextProvider: Send + Sync {
    fn page_content(&self) -> Option<PageContent>;
}

/// A provider that always returns the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticPageContext(pub PageContent);

impl PageContextProvider for StaticPageContext {
    fn page_content(&self) -> Option<PageContent> {
        Some(self.0.clone())
    }
}
