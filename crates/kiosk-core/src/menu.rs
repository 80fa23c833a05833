//! Menu reference data.
//!
//! The menu is read-only for the lifetime of a session. The only lookup the
//! engine performs is the case-insensitive substring match used to price the
//! items the agent puts into an order.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A single item on the kiosk menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Price in whole rupees.
    pub price: u32,
}

impl MenuItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        price: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            price,
        }
    }
}

/// Errors raised while loading a menu file.
#[derive(Debug, thiserror::Error)]
pub enum MenuError {
    #[error("Failed to read menu file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid menu JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Menu must contain at least one item")]
    Empty,
}

/// Ordered, read-only list of menu items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Menu {
    items: Vec<MenuItem>,
}

impl Menu {
    pub const fn new(items: Vec<MenuItem>) -> Self {
        Self { items }
    }

    /// The five-item South Indian menu the kiosk ships with.
    pub fn house_menu() -> Self {
        Self::new(vec![
            MenuItem::new(
                "1",
                "Masala Dosa",
                "Crispy rice crepe filled with spiced potato masala",
                120,
            ),
            MenuItem::new(
                "2",
                "Idli Sambar",
                "Steamed rice cakes served with lentil stew and chutney",
                80,
            ),
            MenuItem::new(
                "3",
                "Chicken Biryani",
                "Fragrant basmati rice layered with spiced chicken",
                250,
            ),
            MenuItem::new(
                "4",
                "Filter Coffee",
                "Traditional South Indian coffee brewed with chicory",
                50,
            ),
            MenuItem::new(
                "5",
                "Mango Lassi",
                "Chilled yogurt drink blended with mango pulp",
                90,
            ),
        ])
    }

    /// Parse a JSON array of menu items.
    pub fn from_json_str(json: &str) -> Result<Self, MenuError> {
        let menu: Self = serde_json::from_str(json)?;
        if menu.items.is_empty() {
            return Err(MenuError::Empty);
        }
        Ok(menu)
    }

    /// Load a menu from a JSON file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MenuError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| MenuError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let menu = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), items = menu.len(), "Loaded menu");
        Ok(menu)
    }

    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find the first item whose name contains `query`, ignoring case.
    ///
    /// Menu order decides ties: "Dosa" matches whichever dosa comes first.
    /// An empty query never matches.
    pub fn resolve(&self, query: &str) -> Option<&MenuItem> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.items
            .iter()
            .find(|item| item.name.to_lowercase().contains(&needle))
    }

    /// One `- Name (price Rs)` line per item, for composing agent prompts.
    pub fn reference_lines(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("- {} ({} Rs)", item.name, item.price))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
