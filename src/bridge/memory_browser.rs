//! In-memory browser model.
//!
//! Serves every capability without a real browser: windows with ordered tabs
//! and per-tab navigation stacks, a bookmark tree whose three root folders
//! cannot be modified, visit history, notifications and context menus.

use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use uuid::Uuid;

use super::capabilities::{
    BookmarkChanges, BookmarkQuery, BookmarkTreeNode, Browser, BrowserError, CreateBookmark,
    CreateTabProperties, CreateWindowData, HistoryItem, HistoryQuery, NotificationOptions,
    OneOrMany, ReloadProperties, Tab, TabQuery, UpdateTabProperties, UpdateWindowInfo, Window,
};
use super::commands::ContextMenuItem;

pub const NEW_TAB_URL: &str = "chrome://newtab/";

const ROOT_FOLDER_ID: &str = "0";
const BOOKMARKS_BAR_ID: &str = "1";
const OTHER_BOOKMARKS_ID: &str = "2";
const DEFAULT_HISTORY_RESULTS: usize = 100;
const BLANK_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

#[derive(Debug)]
struct WindowEntry {
    id: i64,
    incognito: bool,
    window_type: String,
    state: String,
    top: Option<i64>,
    left: Option<i64>,
    width: Option<i64>,
    height: Option<i64>,
}

#[derive(Debug)]
struct TabEntry {
    id: i64,
    window_id: i64,
    url: String,
    title: String,
    active: bool,
    pinned: bool,
    discarded: bool,
    incognito: bool,
    opener_tab_id: Option<i64>,
    back: Vec<String>,
    forward: Vec<String>,
}

#[derive(Debug)]
struct BookmarkEntry {
    id: String,
    parent_id: Option<String>,
    title: String,
    url: Option<String>,
    date_added: f64,
}

#[derive(Debug)]
struct State {
    next_id: i64,
    next_bookmark_id: u64,
    clock_ms: f64,
    focused_window: Option<i64>,
    windows: Vec<WindowEntry>,
    /// Tabs in strip order; a tab's index is its rank among its window's tabs.
    tabs: Vec<TabEntry>,
    bookmarks: Vec<BookmarkEntry>,
    history: Vec<HistoryItem>,
    notifications: Vec<(String, NotificationOptions)>,
    context_menus: Vec<ContextMenuItem>,
}

#[derive(Debug)]
pub struct MemoryBrowser {
    state: StdMutex<State>,
}

impl Default for MemoryBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBrowser {
    /// A browser with no windows and an empty bookmark tree.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State {
            next_id: 1,
            next_bookmark_id: 3,
            clock_ms: 0.0,
            focused_window: None,
            windows: Vec::new(),
            tabs: Vec::new(),
            bookmarks: Vec::new(),
            history: Vec::new(),
            notifications: Vec::new(),
            context_menus: Vec::new(),
        };
        let now = state.now();
        for (id, parent_id, title) in [
            (ROOT_FOLDER_ID, None, ""),
            (BOOKMARKS_BAR_ID, Some(ROOT_FOLDER_ID), "Bookmarks bar"),
            (OTHER_BOOKMARKS_ID, Some(ROOT_FOLDER_ID), "Other bookmarks"),
        ] {
            state.bookmarks.push(BookmarkEntry {
                id: id.to_string(),
                parent_id: parent_id.map(str::to_string),
                title: title.to_string(),
                url: None,
                date_added: now,
            });
        }
        Self {
            state: StdMutex::new(state),
        }
    }

    /// Opens a focused window with one tab per URL (the first one active).
    pub fn open_window(&self, urls: &[&str]) -> i64 {
        let data = CreateWindowData {
            url: Some(OneOrMany::Many(urls.iter().map(|url| (*url).to_string()).collect())),
            ..CreateWindowData::default()
        };
        self.lock().create_window(data).map_or(0, |window| window.id)
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<(String, NotificationOptions)> {
        self.lock().notifications.clone()
    }

    #[must_use]
    pub fn context_menus(&self) -> Vec<ContextMenuItem> {
        self.lock().context_menus.clone()
    }

    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.lock().tabs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory browser mutex poisoned")
    }
}

// ============================================================================
// Tabs and windows
// ============================================================================

impl State {
    fn now(&mut self) -> f64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.clock_ms = wall.max(self.clock_ms + 1.0);
        self.clock_ms
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn tab_position(&self, tab_id: i64) -> Result<usize, BrowserError> {
        self.tabs
            .iter()
            .position(|tab| tab.id == tab_id)
            .ok_or(BrowserError::TabNotFound(tab_id))
    }

    fn window_entry(&self, window_id: i64) -> Result<&WindowEntry, BrowserError> {
        self.windows
            .iter()
            .find(|window| window.id == window_id)
            .ok_or(BrowserError::WindowNotFound(window_id))
    }

    fn window_tab_ids(&self, window_id: i64) -> Vec<i64> {
        self.tabs
            .iter()
            .filter(|tab| tab.window_id == window_id)
            .map(|tab| tab.id)
            .collect()
    }

    fn tab_view(&self, entry: &TabEntry) -> Tab {
        let index = self
            .tabs
            .iter()
            .filter(|tab| tab.window_id == entry.window_id)
            .position(|tab| tab.id == entry.id)
            .unwrap_or_default();
        Tab {
            id: entry.id,
            index,
            window_id: entry.window_id,
            url: entry.url.clone(),
            title: entry.title.clone(),
            active: entry.active,
            pinned: entry.pinned,
            discarded: entry.discarded,
            incognito: entry.incognito,
            status: if entry.discarded { "unloaded" } else { "complete" }.to_string(),
            opener_tab_id: entry.opener_tab_id,
        }
    }

    fn tab_by_id(&self, tab_id: i64) -> Result<Tab, BrowserError> {
        let position = self.tab_position(tab_id)?;
        Ok(self.tab_view(&self.tabs[position]))
    }

    fn window_view(&self, entry: &WindowEntry, populate: bool) -> Window {
        Window {
            id: entry.id,
            focused: self.focused_window == Some(entry.id),
            incognito: entry.incognito,
            window_type: entry.window_type.clone(),
            state: entry.state.clone(),
            top: entry.top,
            left: entry.left,
            width: entry.width,
            height: entry.height,
            tabs: populate.then(|| {
                self.tabs
                    .iter()
                    .filter(|tab| tab.window_id == entry.id)
                    .map(|tab| self.tab_view(tab))
                    .collect()
            }),
        }
    }

    fn activate(&mut self, tab_id: i64) {
        let Some(window_id) = self
            .tabs
            .iter()
            .find(|tab| tab.id == tab_id)
            .map(|tab| tab.window_id)
        else {
            return;
        };
        for tab in self.tabs.iter_mut().filter(|tab| tab.window_id == window_id) {
            tab.active = tab.id == tab_id;
        }
    }

    fn insert_tab(
        &mut self,
        window_id: i64,
        url: String,
        index: Option<usize>,
        active: bool,
        pinned: bool,
        opener_tab_id: Option<i64>,
    ) -> Result<i64, BrowserError> {
        let incognito = self.window_entry(window_id)?.incognito;
        let id = self.allocate_id();
        let siblings: Vec<usize> = self
            .tabs
            .iter()
            .enumerate()
            .filter(|(_, tab)| tab.window_id == window_id)
            .map(|(position, _)| position)
            .collect();
        let position = match index.and_then(|index| siblings.get(index)) {
            Some(&position) => position,
            None => siblings.last().map_or(self.tabs.len(), |last| last + 1),
        };
        let title = title_for(&url);
        self.tabs.insert(
            position,
            TabEntry {
                id,
                window_id,
                url: url.clone(),
                title: title.clone(),
                active: false,
                pinned,
                discarded: false,
                incognito,
                opener_tab_id,
                back: Vec::new(),
                forward: Vec::new(),
            },
        );
        if active || siblings.is_empty() {
            self.activate(id);
        }
        if !incognito {
            self.record_visit(&url, &title);
        }
        Ok(id)
    }

    /// Removes a tab from the strip, keeping its window consistent.
    fn detach_tab(&mut self, tab_id: i64) -> Result<TabEntry, BrowserError> {
        let position = self.tab_position(tab_id)?;
        let window_id = self.tabs[position].window_id;
        let window_index = self
            .window_tab_ids(window_id)
            .iter()
            .position(|id| *id == tab_id)
            .unwrap_or_default();
        let removed = self.tabs.remove(position);
        let remaining = self.window_tab_ids(window_id);
        if let Some(last) = remaining.len().checked_sub(1) {
            if removed.active {
                self.activate(remaining[window_index.min(last)]);
            }
        } else {
            self.drop_window(window_id);
        }
        Ok(removed)
    }

    fn drop_window(&mut self, window_id: i64) {
        self.windows.retain(|window| window.id != window_id);
        self.tabs.retain(|tab| tab.window_id != window_id);
        if self.focused_window == Some(window_id) {
            self.focused_window = self.windows.last().map(|window| window.id);
        }
    }

    fn navigate(&mut self, tab_id: i64, url: String) -> Result<(), BrowserError> {
        let position = self.tab_position(tab_id)?;
        let title = title_for(&url);
        let tab = &mut self.tabs[position];
        let previous = std::mem::replace(&mut tab.url, url.clone());
        tab.back.push(previous);
        tab.forward.clear();
        tab.title.clone_from(&title);
        tab.discarded = false;
        let incognito = tab.incognito;
        if !incognito {
            self.record_visit(&url, &title);
        }
        Ok(())
    }

    fn step_history(&mut self, tab_id: i64, forward: bool) -> Result<(), BrowserError> {
        let position = self.tab_position(tab_id)?;
        let tab = &mut self.tabs[position];
        let (from, to, direction) = if forward {
            (&mut tab.forward, &mut tab.back, "next")
        } else {
            (&mut tab.back, &mut tab.forward, "previous")
        };
        let target = from.pop().ok_or(BrowserError::NoHistoryEntry(direction))?;
        to.push(std::mem::replace(&mut tab.url, target));
        tab.title = title_for(&tab.url);
        Ok(())
    }

    fn query_tabs(&self, query: &TabQuery) -> Vec<Tab> {
        let url_patterns = query.url.clone().map(OneOrMany::into_vec);
        self.tabs
            .iter()
            .map(|entry| self.tab_view(entry))
            .filter(|tab| {
                let in_focused = self.focused_window == Some(tab.window_id);
                query.active.is_none_or(|active| tab.active == active)
                    && query.pinned.is_none_or(|pinned| tab.pinned == pinned)
                    && query.discarded.is_none_or(|discarded| tab.discarded == discarded)
                    && query.current_window.is_none_or(|current| in_focused == current)
                    && query.last_focused_window.is_none_or(|last| in_focused == last)
                    && query.window_id.is_none_or(|window_id| tab.window_id == window_id)
                    && query.index.is_none_or(|index| tab.index == index)
                    && query
                        .title
                        .as_deref()
                        .is_none_or(|pattern| glob_matches(pattern, &tab.title))
                    && url_patterns.as_ref().is_none_or(|patterns| {
                        patterns.iter().any(|pattern| glob_matches(pattern, &tab.url))
                    })
            })
            .collect()
    }

    fn create_window(&mut self, data: CreateWindowData) -> Result<Window, BrowserError> {
        let id = self.allocate_id();
        self.windows.push(WindowEntry {
            id,
            incognito: data.incognito.unwrap_or(false),
            window_type: data.window_type.unwrap_or_else(|| "normal".to_string()),
            state: data.state.unwrap_or_else(|| "normal".to_string()),
            top: data.top,
            left: data.left,
            width: data.width,
            height: data.height,
        });
        if let Some(tab_id) = data.tab_id {
            let mut moved = match self.detach_tab(tab_id) {
                Ok(moved) => moved,
                Err(err) => {
                    self.windows.retain(|window| window.id != id);
                    return Err(err);
                }
            };
            moved.window_id = id;
            moved.active = true;
            self.tabs.push(moved);
        } else {
            let urls = data
                .url
                .map(OneOrMany::into_vec)
                .filter(|urls| !urls.is_empty())
                .unwrap_or_else(|| vec![NEW_TAB_URL.to_string()]);
            for (position, url) in urls.into_iter().enumerate() {
                self.insert_tab(id, url, None, position == 0, false, None)?;
            }
        }
        if data.focused.unwrap_or(true) || self.focused_window.is_none() {
            self.focused_window = Some(id);
        }
        let entry = self.window_entry(id)?;
        Ok(self.window_view(entry, true))
    }

    fn focused_window(&self) -> Result<Window, BrowserError> {
        let id = self.focused_window.ok_or(BrowserError::NoCurrentWindow)?;
        let entry = self.window_entry(id)?;
        Ok(self.window_view(entry, false))
    }
}

// ============================================================================
// History and bookmarks
// ============================================================================

impl State {
    fn record_visit(&mut self, url: &str, title: &str) {
        if url.starts_with("chrome://") {
            return;
        }
        let now = self.now();
        if let Some(item) = self.history.iter_mut().find(|item| item.url == url) {
            item.visit_count += 1;
            item.last_visit_time = now;
            item.title = title.to_string();
            return;
        }
        let id = (self.history.len() + 1).to_string();
        self.history.push(HistoryItem {
            id,
            url: url.to_string(),
            title: title.to_string(),
            last_visit_time: now,
            visit_count: 1,
        });
    }

    fn search_history(&self, query: &HistoryQuery) -> Vec<HistoryItem> {
        let mut items: Vec<HistoryItem> = self
            .history
            .iter()
            .filter(|item| words_match(&query.text, &[item.title.as_str(), item.url.as_str()]))
            .filter(|item| query.start_time.is_none_or(|start| item.last_visit_time >= start))
            .filter(|item| query.end_time.is_none_or(|end| item.last_visit_time <= end))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.last_visit_time.total_cmp(&a.last_visit_time));
        items.truncate(query.max_results.unwrap_or(DEFAULT_HISTORY_RESULTS));
        items
    }

    fn bookmark(&self, id: &str) -> Result<&BookmarkEntry, BrowserError> {
        self.bookmarks
            .iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| BrowserError::BookmarkNotFound(id.to_string()))
    }

    fn bookmark_node(&self, entry: &BookmarkEntry, with_children: bool) -> BookmarkTreeNode {
        let index = entry.parent_id.as_deref().and_then(|parent| {
            self.bookmarks
                .iter()
                .filter(|sibling| sibling.parent_id.as_deref() == Some(parent))
                .position(|sibling| sibling.id == entry.id)
        });
        let children = (with_children && entry.url.is_none()).then(|| {
            self.bookmarks
                .iter()
                .filter(|child| child.parent_id.as_deref() == Some(entry.id.as_str()))
                .map(|child| self.bookmark_node(child, true))
                .collect()
        });
        BookmarkTreeNode {
            id: entry.id.clone(),
            parent_id: entry.parent_id.clone(),
            index,
            title: entry.title.clone(),
            url: entry.url.clone(),
            date_added: Some(entry.date_added),
            children,
        }
    }

    fn create_bookmark(&mut self, bookmark: CreateBookmark) -> Result<BookmarkTreeNode, BrowserError> {
        let parent_id = bookmark
            .parent_id
            .unwrap_or_else(|| OTHER_BOOKMARKS_ID.to_string());
        if parent_id == ROOT_FOLDER_ID {
            return Err(BrowserError::RootBookmarkModification);
        }
        if self.bookmark(&parent_id)?.url.is_some() {
            return Err(BrowserError::Rejected(
                "Parameter 'parentId' does not specify a folder.".to_string(),
            ));
        }
        if let Some(url) = &bookmark.url {
            validate_url(url)?;
        }
        let siblings: Vec<usize> = self
            .bookmarks
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.parent_id.as_deref() == Some(parent_id.as_str()))
            .map(|(position, _)| position)
            .collect();
        let position = match bookmark.index.and_then(|index| siblings.get(index)) {
            Some(&position) => position,
            None => {
                let parent_position = self
                    .bookmarks
                    .iter()
                    .position(|entry| entry.id == parent_id)
                    .unwrap_or_default();
                siblings.last().map_or(parent_position + 1, |last| last + 1)
            }
        };
        let id = self.next_bookmark_id.to_string();
        self.next_bookmark_id += 1;
        let date_added = self.now();
        self.bookmarks.insert(
            position,
            BookmarkEntry {
                id: id.clone(),
                parent_id: Some(parent_id),
                title: bookmark.title.unwrap_or_default(),
                url: bookmark.url,
                date_added,
            },
        );
        let entry = self.bookmark(&id)?;
        Ok(self.bookmark_node(entry, false))
    }

    fn update_bookmark(
        &mut self,
        id: &str,
        changes: BookmarkChanges,
    ) -> Result<BookmarkTreeNode, BrowserError> {
        if is_root_folder(id) {
            return Err(BrowserError::RootBookmarkModification);
        }
        let is_folder = self.bookmark(id)?.url.is_none();
        if let Some(url) = &changes.url {
            if is_folder {
                return Err(BrowserError::Rejected(
                    "Can't set URL of a bookmark folder.".to_string(),
                ));
            }
            validate_url(url)?;
        }
        if let Some(entry) = self.bookmarks.iter_mut().find(|entry| entry.id == id) {
            if let Some(title) = changes.title {
                entry.title = title;
            }
            if let Some(url) = changes.url {
                entry.url = Some(url);
            }
        }
        let entry = self.bookmark(id)?;
        Ok(self.bookmark_node(entry, false))
    }

    fn remove_bookmark(&mut self, id: &str) -> Result<(), BrowserError> {
        if is_root_folder(id) {
            return Err(BrowserError::RootBookmarkModification);
        }
        self.bookmark(id)?;
        if self
            .bookmarks
            .iter()
            .any(|entry| entry.parent_id.as_deref() == Some(id))
        {
            return Err(BrowserError::NonEmptyFolder(id.to_string()));
        }
        self.bookmarks.retain(|entry| entry.id != id);
        Ok(())
    }

    fn search_bookmarks(&self, query: &BookmarkQuery) -> Vec<BookmarkTreeNode> {
        self.bookmarks
            .iter()
            .filter(|entry| !is_root_folder(&entry.id))
            .filter(|entry| {
                let url = entry.url.as_deref().unwrap_or_default();
                match query {
                    BookmarkQuery::Text(text) => {
                        !text.trim().is_empty() && words_match(text, &[entry.title.as_str(), url])
                    }
                    BookmarkQuery::Fields(fields) => {
                        fields
                            .query
                            .as_deref()
                            .is_none_or(|text| words_match(text, &[entry.title.as_str(), url]))
                            && fields
                                .url
                                .as_deref()
                                .is_none_or(|wanted| entry.url.as_deref() == Some(wanted))
                            && fields.title.as_deref().is_none_or(|wanted| entry.title == wanted)
                    }
                }
            })
            .map(|entry| self.bookmark_node(entry, false))
            .collect()
    }
}

// ============================================================================
// Browser
// ============================================================================

#[async_trait]
impl Browser for MemoryBrowser {
    async fn query_tabs(&self, query: TabQuery) -> Result<Vec<Tab>, BrowserError> {
        Ok(self.lock().query_tabs(&query))
    }

    async fn get_tab(&self, tab_id: i64) -> Result<Tab, BrowserError> {
        self.lock().tab_by_id(tab_id)
    }

    async fn create_tab(&self, properties: CreateTabProperties) -> Result<Tab, BrowserError> {
        let mut state = self.lock();
        let window_id = match properties.window_id {
            Some(window_id) => window_id,
            None => state.focused_window.ok_or(BrowserError::NoCurrentWindow)?,
        };
        let id = state.insert_tab(
            window_id,
            properties.url.unwrap_or_else(|| NEW_TAB_URL.to_string()),
            properties.index,
            properties.active.unwrap_or(true),
            properties.pinned.unwrap_or(false),
            properties.opener_tab_id,
        )?;
        state.tab_by_id(id)
    }

    async fn duplicate_tab(&self, tab_id: i64) -> Result<Tab, BrowserError> {
        let mut state = self.lock();
        let original = state.tab_by_id(tab_id)?;
        let id = state.insert_tab(
            original.window_id,
            original.url,
            Some(original.index + 1),
            true,
            original.pinned,
            Some(tab_id),
        )?;
        state.tab_by_id(id)
    }

    async fn discard_tab(&self, tab_id: i64) -> Result<(), BrowserError> {
        let mut state = self.lock();
        let position = state.tab_position(tab_id)?;
        let tab = &mut state.tabs[position];
        if tab.active {
            return Err(BrowserError::Rejected(format!(
                "Cannot discard tab with id: {tab_id}."
            )));
        }
        tab.discarded = true;
        Ok(())
    }

    async fn remove_tabs(&self, tab_ids: Vec<i64>) -> Result<(), BrowserError> {
        let mut state = self.lock();
        for tab_id in &tab_ids {
            state.tab_position(*tab_id)?;
        }
        for tab_id in tab_ids {
            state.detach_tab(tab_id)?;
        }
        Ok(())
    }

    async fn capture_visible_tab(&self, window_id: Option<i64>) -> Result<String, BrowserError> {
        let state = self.lock();
        let window_id = match window_id {
            Some(window_id) => state.window_entry(window_id)?.id,
            None => state.focused_window.ok_or(BrowserError::NoCurrentWindow)?,
        };
        if !state
            .tabs
            .iter()
            .any(|tab| tab.window_id == window_id && tab.active)
        {
            return Err(BrowserError::Rejected("No active tab".to_string()));
        }
        Ok(format!("data:image/png;base64,{BLANK_PNG_BASE64}"))
    }

    async fn update_tab(
        &self,
        tab_id: i64,
        properties: UpdateTabProperties,
    ) -> Result<Tab, BrowserError> {
        let mut state = self.lock();
        state.tab_position(tab_id)?;
        if let Some(url) = properties.url {
            state.navigate(tab_id, url)?;
        }
        if properties.active == Some(true) {
            state.activate(tab_id);
        }
        if let Some(pinned) = properties.pinned {
            let position = state.tab_position(tab_id)?;
            state.tabs[position].pinned = pinned;
        }
        state.tab_by_id(tab_id)
    }

    async fn reload_tab(
        &self,
        tab_id: i64,
        _properties: ReloadProperties,
    ) -> Result<(), BrowserError> {
        let mut state = self.lock();
        let position = state.tab_position(tab_id)?;
        state.tabs[position].discarded = false;
        Ok(())
    }

    async fn go_forward(&self, tab_id: i64) -> Result<(), BrowserError> {
        self.lock().step_history(tab_id, true)
    }

    async fn go_back(&self, tab_id: i64) -> Result<(), BrowserError> {
        self.lock().step_history(tab_id, false)
    }

    async fn page_html(&self, tab_id: i64) -> Result<String, BrowserError> {
        let tab = self.lock().tab_by_id(tab_id)?;
        Ok(format!(
            "<html><head><title>{}</title></head><body></body></html>",
            escape_html(&tab.title)
        ))
    }

    async fn all_windows(&self) -> Result<Vec<Window>, BrowserError> {
        let state = self.lock();
        Ok(state
            .windows
            .iter()
            .map(|window| state.window_view(window, false))
            .collect())
    }

    async fn get_window(&self, window_id: i64) -> Result<Window, BrowserError> {
        let state = self.lock();
        let entry = state.window_entry(window_id)?;
        Ok(state.window_view(entry, false))
    }

    async fn current_window(&self) -> Result<Window, BrowserError> {
        self.lock().focused_window()
    }

    async fn last_focused_window(&self) -> Result<Window, BrowserError> {
        self.lock().focused_window()
    }

    async fn create_window(&self, data: CreateWindowData) -> Result<Window, BrowserError> {
        self.lock().create_window(data)
    }

    async fn remove_window(&self, window_id: i64) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.window_entry(window_id)?;
        state.drop_window(window_id);
        Ok(())
    }

    async fn update_window(
        &self,
        window_id: i64,
        info: UpdateWindowInfo,
    ) -> Result<Window, BrowserError> {
        let mut state = self.lock();
        state.window_entry(window_id)?;
        match info.focused {
            Some(true) => state.focused_window = Some(window_id),
            Some(false) if state.focused_window == Some(window_id) => {
                state.focused_window = state
                    .windows
                    .iter()
                    .rev()
                    .map(|window| window.id)
                    .find(|id| *id != window_id);
            }
            _ => {}
        }
        if let Some(window) = state.windows.iter_mut().find(|window| window.id == window_id) {
            if let Some(value) = info.state {
                window.state = value;
            }
            window.top = info.top.or(window.top);
            window.left = info.left.or(window.left);
            window.width = info.width.or(window.width);
            window.height = info.height.or(window.height);
        }
        let entry = state.window_entry(window_id)?;
        Ok(state.window_view(entry, false))
    }

    async fn search_history(&self, query: HistoryQuery) -> Result<Vec<HistoryItem>, BrowserError> {
        Ok(self.lock().search_history(&query))
    }

    async fn bookmark_tree(&self) -> Result<Vec<BookmarkTreeNode>, BrowserError> {
        let state = self.lock();
        let root = state.bookmark(ROOT_FOLDER_ID)?;
        Ok(vec![state.bookmark_node(root, true)])
    }

    async fn recent_bookmarks(&self, count: usize) -> Result<Vec<BookmarkTreeNode>, BrowserError> {
        if count == 0 {
            return Err(BrowserError::Rejected(
                "Parameter 'numberOfItems' must be at least 1.".to_string(),
            ));
        }
        let state = self.lock();
        let mut entries: Vec<&BookmarkEntry> = state
            .bookmarks
            .iter()
            .filter(|entry| entry.url.is_some())
            .collect();
        entries.sort_by(|a, b| b.date_added.total_cmp(&a.date_added));
        Ok(entries
            .into_iter()
            .take(count)
            .map(|entry| state.bookmark_node(entry, false))
            .collect())
    }

    async fn search_bookmarks(
        &self,
        query: BookmarkQuery,
    ) -> Result<Vec<BookmarkTreeNode>, BrowserError> {
        Ok(self.lock().search_bookmarks(&query))
    }

    async fn create_bookmark(
        &self,
        bookmark: CreateBookmark,
    ) -> Result<BookmarkTreeNode, BrowserError> {
        self.lock().create_bookmark(bookmark)
    }

    async fn update_bookmark(
        &self,
        id: &str,
        changes: BookmarkChanges,
    ) -> Result<BookmarkTreeNode, BrowserError> {
        self.lock().update_bookmark(id, changes)
    }

    async fn remove_bookmark(&self, id: &str) -> Result<(), BrowserError> {
        self.lock().remove_bookmark(id)
    }

    async fn create_notification(
        &self,
        id: Option<String>,
        options: NotificationOptions,
    ) -> Result<String, BrowserError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.lock();
        state.notifications.retain(|(existing, _)| *existing != id);
        state.notifications.push((id.clone(), options));
        Ok(id)
    }

    async fn set_context_menus(&self, items: Vec<ContextMenuItem>) -> Result<(), BrowserError> {
        self.lock().context_menus = items;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn is_root_folder(id: &str) -> bool {
    matches!(id, ROOT_FOLDER_ID | BOOKMARKS_BAR_ID | OTHER_BOOKMARKS_ID)
}

fn validate_url(url: &str) -> Result<(), BrowserError> {
    url::Url::parse(url)
        .map(drop)
        .map_err(|_| BrowserError::Rejected("Invalid URL.".to_string()))
}

fn title_for(url: &str) -> String {
    if url == NEW_TAB_URL {
        return "New Tab".to_string();
    }
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Every whitespace-separated word must occur in one of `fields`.
fn words_match(text: &str, fields: &[&str]) -> bool {
    let haystacks: Vec<String> = fields.iter().map(|field| field.to_lowercase()).collect();
    text.split_whitespace().all(|word| {
        let word = word.to_lowercase();
        haystacks.iter().any(|haystack| haystack.contains(&word))
    })
}

/// Match pattern with `*` wildcards; `<all_urls>` matches everything.
fn glob_matches(pattern: &str, text: &str) -> bool {
    if pattern == "<all_urls>" {
        return true;
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, mark)) = backtrack {
            p = star + 1;
            t = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_matches("*://example.com/*", "https://example.com/a/b"));
        assert!(glob_matches("<all_urls>", "chrome://newtab/"));
        assert!(glob_matches("*", ""));
        assert!(!glob_matches("https://*.rs/", "https://docs.rs/x"));
        assert!(glob_matches("a*b*c", "aXXbYYc"));
        assert!(!glob_matches("a*b", "aXXc"));
    }

    #[tokio::test]
    async fn tabs_track_activity_and_order() {
        let browser = MemoryBrowser::new();
        let window = browser.open_window(&["https://a.example/", "https://b.example/"]);

        let active = browser.query_tabs(TabQuery::active_tab()).await.expect("query");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].url, "https://a.example/");

        let created = browser
            .create_tab(CreateTabProperties {
                url: Some("https://c.example/".to_string()),
                index: Some(1),
                ..CreateTabProperties::default()
            })
            .await
            .expect("create");
        assert_eq!(created.window_id, window);
        assert_eq!(created.index, 1);
        assert!(created.active);

        let all = browser
            .query_tabs(TabQuery {
                window_id: Some(window),
                ..TabQuery::default()
            })
            .await
            .expect("query");
        let urls: Vec<&str> = all.iter().map(|tab| tab.url.as_str()).collect();
        assert_eq!(urls, ["https://a.example/", "https://c.example/", "https://b.example/"]);
        assert_eq!(all.iter().filter(|tab| tab.active).count(), 1);

        browser.remove_tabs(vec![created.id]).await.expect("remove");
        let active = browser.query_tabs(TabQuery::active_tab()).await.expect("query");
        assert_eq!(active[0].url, "https://b.example/", "neighbor becomes active");
    }

    #[tokio::test]
    async fn removing_last_tab_closes_window() {
        let browser = MemoryBrowser::new();
        let window = browser.open_window(&["https://a.example/"]);
        let tab = browser.query_tabs(TabQuery::default()).await.expect("query")[0].id;
        browser.remove_tabs(vec![tab]).await.expect("remove");
        assert_eq!(
            browser.get_window(window).await,
            Err(BrowserError::WindowNotFound(window))
        );
        assert_eq!(browser.current_window().await, Err(BrowserError::NoCurrentWindow));
    }

    #[tokio::test]
    async fn navigation_stacks() {
        let browser = MemoryBrowser::new();
        browser.open_window(&["https://one.example/"]);
        let tab = browser.query_tabs(TabQuery::active_tab()).await.expect("query")[0].id;
        assert_eq!(
            browser.go_back(tab).await,
            Err(BrowserError::NoHistoryEntry("previous"))
        );

        browser
            .update_tab(
                tab,
                UpdateTabProperties {
                    url: Some("https://two.example/".to_string()),
                    ..UpdateTabProperties::default()
                },
            )
            .await
            .expect("navigate");
        browser.go_back(tab).await.expect("back");
        assert_eq!(browser.get_tab(tab).await.expect("tab").url, "https://one.example/");
        browser.go_forward(tab).await.expect("forward");
        assert_eq!(browser.get_tab(tab).await.expect("tab").title, "two.example");

        let history = browser
            .search_history(HistoryQuery {
                text: "example".to_string(),
                ..HistoryQuery::default()
            })
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].url, "https://two.example/", "most recent first");
    }

    #[tokio::test]
    async fn bookmark_tree_rules() {
        let browser = MemoryBrowser::new();
        let folder = browser
            .create_bookmark(CreateBookmark {
                parent_id: Some(BOOKMARKS_BAR_ID.to_string()),
                title: Some("Docs".to_string()),
                ..CreateBookmark::default()
            })
            .await
            .expect("folder");
        let mark = browser
            .create_bookmark(CreateBookmark {
                parent_id: Some(folder.id.clone()),
                title: Some("Rust".to_string()),
                url: Some("https://www.rust-lang.org/".to_string()),
                ..CreateBookmark::default()
            })
            .await
            .expect("bookmark");
        assert_eq!(mark.parent_id.as_deref(), Some(folder.id.as_str()));
        assert_eq!(mark.index, Some(0));

        assert_eq!(
            browser.remove_bookmark(&folder.id).await,
            Err(BrowserError::NonEmptyFolder(folder.id.clone()))
        );
        assert_eq!(
            browser.remove_bookmark(BOOKMARKS_BAR_ID).await,
            Err(BrowserError::RootBookmarkModification)
        );
        assert!(matches!(
            browser
                .update_bookmark(
                    &folder.id,
                    BookmarkChanges {
                        url: Some("https://x.example/".to_string()),
                        ..BookmarkChanges::default()
                    }
                )
                .await,
            Err(BrowserError::Rejected(_))
        ));

        let tree = browser.bookmark_tree().await.expect("tree");
        let bar = &tree[0].children.as_ref().expect("root children")[0];
        let docs = &bar.children.as_ref().expect("bar children")[0];
        assert_eq!(docs.title, "Docs");
        assert_eq!(docs.children.as_ref().map(Vec::len), Some(1));

        let found = browser
            .search_bookmarks(BookmarkQuery::Text("rust LANG".to_string()))
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(browser.recent_bookmarks(5).await.expect("recent")[0].id, mark.id);

        browser.remove_bookmark(&mark.id).await.expect("remove leaf");
        browser.remove_bookmark(&folder.id).await.expect("remove empty folder");
    }

    #[tokio::test]
    async fn notifications_replace_by_id() {
        let browser = MemoryBrowser::new();
        let generated = browser
            .create_notification(None, NotificationOptions::default())
            .await
            .expect("notify");
        assert!(!generated.is_empty());
        browser
            .create_notification(Some("n".to_string()), NotificationOptions::default())
            .await
            .expect("notify");
        browser
            .create_notification(
                Some("n".to_string()),
                NotificationOptions {
                    title: "again".to_string(),
                    ..NotificationOptions::default()
                },
            )
            .await
            .expect("notify");
        let notifications = browser.notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[1].1.title, "again");
    }
}
