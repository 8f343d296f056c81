//! Host-defined commands and the context menu built from them.

use serde::{Deserialize, Serialize};

pub const OPEN_IN_NEW_TAB: &str = "openInNewTab";
pub const OPEN_IN_NEW_WINDOW: &str = "openInNewWindow";
pub const RUN_COMMAND_MENU: &str = "runCommand";
pub const COMMAND_PREFIX: &str = "commands:";

const ALL_CONTEXTS: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMeta {
    pub title: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url_patterns: Option<Vec<String>>,
}

/// One entry of the `commands.update` list pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    pub meta: CommandMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMenuItem {
    pub id: String,
    pub title: String,
    pub contexts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url_patterns: Option<Vec<String>>,
}

impl ContextMenuItem {
    fn top_level(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            contexts: vec![ALL_CONTEXTS.to_string()],
            parent_id: None,
            document_url_patterns: None,
            target_url_patterns: None,
        }
    }
}

/// Full menu for `commands`: the two terminal openers always, then a
/// "Run Command" parent with one child per command when any exist.
#[must_use]
pub fn context_menu_items(commands: &[CommandSpec]) -> Vec<ContextMenuItem> {
    let mut items = vec![
        ContextMenuItem::top_level(OPEN_IN_NEW_TAB, "Open in New Tab"),
        ContextMenuItem::top_level(OPEN_IN_NEW_WINDOW, "Open in New Window"),
    ];
    if commands.is_empty() {
        return items;
    }
    items.push(ContextMenuItem::top_level(RUN_COMMAND_MENU, "Run Command"));
    items.extend(commands.iter().map(|command| ContextMenuItem {
        id: format!("{COMMAND_PREFIX}{}", command.id),
        title: command.meta.title.clone(),
        contexts: command.meta.contexts.clone(),
        parent_id: Some(RUN_COMMAND_MENU.to_string()),
        document_url_patterns: command.meta.document_url_patterns.clone(),
        target_url_patterns: command.meta.target_url_patterns.clone(),
    }));
    items
}

/// What a menu click or keyboard shortcut asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    OpenInNewTab,
    OpenInNewWindow,
    Run(String),
}

impl CommandAction {
    /// `commands:<name>` runs `<name>`, which ends at the next `:`.
    #[must_use]
    pub fn parse(command_id: &str) -> Option<Self> {
        match command_id {
            OPEN_IN_NEW_TAB => Some(Self::OpenInNewTab),
            OPEN_IN_NEW_WINDOW => Some(Self::OpenInNewWindow),
            other => {
                let name = other.strip_prefix(COMMAND_PREFIX)?.split(':').next()?;
                (!name.is_empty()).then(|| Self::Run(name.to_string()))
            }
        }
    }
}

/// Context of a menu click, forwarded as the command input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuClickInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}
