//! Browser capabilities the native host may drive, with typed arguments and
//! results. Field names follow the browser extension API (camelCase on the
//! wire).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::commands::ContextMenuItem;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("No tab with id: {0}.")]
    TabNotFound(i64),
    #[error("No window with id: {0}.")]
    WindowNotFound(i64),
    #[error("No current window")]
    NoCurrentWindow,
    #[error("Can't find bookmark for id {0}.")]
    BookmarkNotFound(String),
    #[error("Can't modify the root bookmark folders.")]
    RootBookmarkModification,
    #[error("Can't remove non-empty folder (use recursive to force).")]
    NonEmptyFolder(String),
    #[error("Cannot find a {0} page in history.")]
    NoHistoryEntry(&'static str),
    #[error("{0}")]
    Rejected(String),
}

/// A value the extension API accepts either bare or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

// ============================================================================
// Tabs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: i64,
    pub index: usize,
    pub window_id: i64,
    pub url: String,
    pub title: String,
    pub active: bool,
    pub pinned: bool,
    pub discarded: bool,
    pub incognito: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TabQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_window: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_focused_window: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// URL match patterns such as `*://example.com/*`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<OneOrMany<String>>,
}

impl TabQuery {
    /// The active tab of the last-focused window.
    #[must_use]
    pub fn active_tab() -> Self {
        Self {
            active: Some(true),
            last_focused_window: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTabProperties {
    pub window_id: Option<i64>,
    pub url: Option<String>,
    pub active: Option<bool>,
    pub pinned: Option<bool>,
    pub index: Option<usize>,
    pub opener_tab_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTabProperties {
    pub url: Option<String>,
    pub active: Option<bool>,
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReloadProperties {
    pub bypass_cache: Option<bool>,
}

// ============================================================================
// Windows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub id: i64,
    pub focused: bool,
    pub incognito: bool,
    #[serde(rename = "type")]
    pub window_type: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<Tab>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWindowData {
    pub url: Option<OneOrMany<String>>,
    pub tab_id: Option<i64>,
    pub focused: Option<bool>,
    pub incognito: Option<bool>,
    #[serde(rename = "type")]
    pub window_type: Option<String>,
    pub state: Option<String>,
    pub top: Option<i64>,
    pub left: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateWindowInfo {
    pub focused: Option<bool>,
    pub state: Option<String>,
    pub top: Option<i64>,
    pub left: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

// ============================================================================
// History and bookmarks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryQuery {
    pub text: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub url: String,
    pub title: String,
    pub last_visit_time: f64,
    pub visit_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkTreeNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<BookmarkTreeNode>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBookmark {
    pub parent_id: Option<String>,
    pub index: Option<usize>,
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookmarkChanges {
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookmarkSearchFields {
    pub query: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
}

/// `bookmarks.search` takes a free-text string or a field query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BookmarkQuery {
    Text(String),
    Fields(BookmarkSearchFields),
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationOptions {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub icon_url: Option<String>,
    pub title: String,
    pub message: String,
    pub context_message: Option<String>,
}

// ============================================================================
// Browser
// ============================================================================

/// The browser surface a host-initiated call may reach.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn query_tabs(&self, query: TabQuery) -> Result<Vec<Tab>, BrowserError>;
    async fn get_tab(&self, tab_id: i64) -> Result<Tab, BrowserError>;
    async fn create_tab(&self, properties: CreateTabProperties) -> Result<Tab, BrowserError>;
    async fn duplicate_tab(&self, tab_id: i64) -> Result<Tab, BrowserError>;
    async fn discard_tab(&self, tab_id: i64) -> Result<(), BrowserError>;
    async fn remove_tabs(&self, tab_ids: Vec<i64>) -> Result<(), BrowserError>;
    /// PNG data URL of the visible area of a window (current window if `None`).
    async fn capture_visible_tab(&self, window_id: Option<i64>) -> Result<String, BrowserError>;
    async fn update_tab(
        &self,
        tab_id: i64,
        properties: UpdateTabProperties,
    ) -> Result<Tab, BrowserError>;
    async fn reload_tab(&self, tab_id: i64, properties: ReloadProperties)
    -> Result<(), BrowserError>;
    async fn go_forward(&self, tab_id: i64) -> Result<(), BrowserError>;
    async fn go_back(&self, tab_id: i64) -> Result<(), BrowserError>;
    /// Serialized `document.documentElement.outerHTML` of a tab.
    async fn page_html(&self, tab_id: i64) -> Result<String, BrowserError>;

    async fn all_windows(&self) -> Result<Vec<Window>, BrowserError>;
    async fn get_window(&self, window_id: i64) -> Result<Window, BrowserError>;
    async fn current_window(&self) -> Result<Window, BrowserError>;
    async fn last_focused_window(&self) -> Result<Window, BrowserError>;
    async fn create_window(&self, data: CreateWindowData) -> Result<Window, BrowserError>;
    async fn remove_window(&self, window_id: i64) -> Result<(), BrowserError>;
    async fn update_window(
        &self,
        window_id: i64,
        info: UpdateWindowInfo,
    ) -> Result<Window, BrowserError>;

    async fn search_history(&self, query: HistoryQuery) -> Result<Vec<HistoryItem>, BrowserError>;

    async fn bookmark_tree(&self) -> Result<Vec<BookmarkTreeNode>, BrowserError>;
    async fn recent_bookmarks(&self, count: usize) -> Result<Vec<BookmarkTreeNode>, BrowserError>;
    async fn search_bookmarks(
        &self,
        query: BookmarkQuery,
    ) -> Result<Vec<BookmarkTreeNode>, BrowserError>;
    async fn create_bookmark(&self, bookmark: CreateBookmark)
    -> Result<BookmarkTreeNode, BrowserError>;
    async fn update_bookmark(
        &self,
        id: &str,
        changes: BookmarkChanges,
    ) -> Result<BookmarkTreeNode, BrowserError>;
    async fn remove_bookmark(&self, id: &str) -> Result<(), BrowserError>;

    /// Shows a notification and returns its id (generated when `id` is `None`).
    async fn create_notification(
        &self,
        id: Option<String>,
        options: NotificationOptions,
    ) -> Result<String, BrowserError>;

    /// Replaces every context menu entry owned by the extension.
    async fn set_context_menus(&self, items: Vec<ContextMenuItem>) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tab_query_accepts_browser_field_names() {
        let query: TabQuery = serde_json::from_value(json!({
            "active": true,
            "lastFocusedWindow": true,
            "url": "*://example.com/*"
        }))
        .expect("parse");
        assert_eq!(query.active, Some(true));
        assert_eq!(query.last_focused_window, Some(true));
        assert_eq!(
            query.url.map(OneOrMany::into_vec),
            Some(vec!["*://example.com/*".to_string()])
        );
        assert_eq!(
            serde_json::to_value(TabQuery::active_tab()).expect("serialize"),
            json!({"active": true, "lastFocusedWindow": true})
        );
    }

    #[test]
    fn bookmark_query_is_text_or_fields() {
        let text: BookmarkQuery = serde_json::from_value(json!("rust")).expect("text");
        assert_eq!(text, BookmarkQuery::Text("rust".to_string()));
        let fields: BookmarkQuery =
            serde_json::from_value(json!({"url": "https://example.com/"})).expect("fields");
        assert!(matches!(fields, BookmarkQuery::Fields(BookmarkSearchFields { url: Some(_), .. })));
    }

    #[test]
    fn window_type_uses_reserved_field_name() {
        let window = Window {
            id: 1,
            focused: true,
            incognito: false,
            window_type: "normal".to_string(),
            state: "normal".to_string(),
            top: None,
            left: None,
            width: None,
            height: None,
            tabs: None,
        };
        let value = serde_json::to_value(&window).expect("serialize");
        assert_eq!(value["type"], json!("normal"));
        assert!(value.get("tabs").is_none(), "unpopulated tabs are omitted");
    }
}
