//! Dispatch of host-initiated requests to browser capabilities.
//!
//! Capability calls take positional (array) params. Every failure maps to a
//! JSON-RPC error: -32602 for bad params, -32601 for unknown methods and
//! -32000 for a failing handler. Notifications never get a response.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::Instrument as _;

use super::capabilities::{
    BookmarkChanges, BookmarkQuery, Browser, BrowserError, CreateBookmark, CreateTabProperties,
    CreateWindowData, HistoryQuery, NotificationOptions, OneOrMany, ReloadProperties, TabQuery,
    UpdateTabProperties, UpdateWindowInfo,
};
use super::commands::{CommandSpec, context_menu_items};
use super::fetch::{FetchError, FetchInit, HttpFetcher};
use super::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, RpcErrorObject, RpcRequest, RpcResponse};
use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    TabsQuery,
    TabsGet,
    TabsCreate,
    TabsDuplicate,
    TabsDiscard,
    TabsRemove,
    TabsCaptureVisibleTab,
    TabsUpdate,
    TabsReload,
    TabsGoForward,
    TabsGoBack,
    TabsPrint,
    WindowsGetAll,
    WindowsGet,
    WindowsGetCurrent,
    WindowsGetLastFocused,
    WindowsCreate,
    WindowsRemove,
    WindowsUpdate,
    HistorySearch,
    BookmarksGetTree,
    BookmarksGetRecent,
    BookmarksSearch,
    BookmarksCreate,
    BookmarksUpdate,
    BookmarksRemove,
    NotificationsCreate,
    Fetch,
    CommandsUpdate,
}

const METHOD_NAMES: &[(&str, Method)] = &[
    ("tabs.query", Method::TabsQuery),
    ("tabs.get", Method::TabsGet),
    ("tabs.create", Method::TabsCreate),
    ("tabs.duplicate", Method::TabsDuplicate),
    ("tabs.discard", Method::TabsDiscard),
    ("tabs.remove", Method::TabsRemove),
    ("tabs.captureVisibleTab", Method::TabsCaptureVisibleTab),
    ("tabs.update", Method::TabsUpdate),
    ("tabs.reload", Method::TabsReload),
    ("tabs.goForward", Method::TabsGoForward),
    ("tabs.goBack", Method::TabsGoBack),
    ("tabs.print", Method::TabsPrint),
    ("windows.getAll", Method::WindowsGetAll),
    ("windows.get", Method::WindowsGet),
    ("windows.getCurrent", Method::WindowsGetCurrent),
    ("windows.getLastFocused", Method::WindowsGetLastFocused),
    ("windows.create", Method::WindowsCreate),
    ("windows.remove", Method::WindowsRemove),
    ("windows.update", Method::WindowsUpdate),
    ("history.search", Method::HistorySearch),
    ("bookmarks.getTree", Method::BookmarksGetTree),
    ("bookmarks.getRecent", Method::BookmarksGetRecent),
    ("bookmarks.search", Method::BookmarksSearch),
    ("bookmarks.create", Method::BookmarksCreate),
    ("bookmarks.update", Method::BookmarksUpdate),
    ("bookmarks.remove", Method::BookmarksRemove),
    ("notifications.create", Method::NotificationsCreate),
    ("fetch", Method::Fetch),
    ("commands.update", Method::CommandsUpdate),
];

impl Method {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        METHOD_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, method)| *method)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        METHOD_NAMES
            .iter()
            .find(|(_, method)| *method == self)
            .map_or("", |(name, _)| name)
    }

    pub fn all() -> impl Iterator<Item = Self> {
        METHOD_NAMES.iter().map(|(_, method)| *method)
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Invalid params: expected an array")]
    ParamsNotArray,
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("No active tab found")]
    NoActiveTab,
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("Failed to get tab content: {0}")]
    PageContent(#[source] BrowserError),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CapabilityError {
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::ParamsNotArray | Self::InvalidParams(_) | Self::NoActiveTab => INVALID_PARAMS,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::Browser(_) | Self::PageContent(_) | Self::Fetch(_) | Self::Encode(_) => {
                INTERNAL_ERROR
            }
        }
    }

    #[must_use]
    pub fn to_rpc_error(&self) -> RpcErrorObject {
        RpcErrorObject::new(self.code(), self.to_string())
    }
}

// ============================================================================
// Positional params
// ============================================================================

struct Params(Vec<Value>);

impl Params {
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Present and non-null argument at `index`.
    fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index).filter(|value| !value.is_null())
    }

    fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, CapabilityError> {
        let value = self
            .get(index)
            .ok_or_else(|| CapabilityError::InvalidParams(format!("Invalid params: missing {name}")))?;
        decode(value, name)
    }

    fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, CapabilityError> {
        self.get(index).map(|value| decode(value, name)).transpose()
    }

    fn or_default<T: DeserializeOwned + Default>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<T, CapabilityError> {
        Ok(self.optional(index, name)?.unwrap_or_default())
    }

    /// Bookmark ids are strings; integers are accepted for convenience.
    fn bookmark_id(&self, index: usize) -> Result<String, CapabilityError> {
        match self.get(index) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) if id.is_u64() => Ok(id.to_string()),
            _ => Err(CapabilityError::InvalidParams(
                "Invalid params: id must be a string".to_string(),
            )),
        }
    }
}

fn decode<T: DeserializeOwned>(value: &Value, name: &str) -> Result<T, CapabilityError> {
    T::deserialize(value)
        .map_err(|err| CapabilityError::InvalidParams(format!("Invalid params: {name}: {err}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, CapabilityError> {
    Ok(serde_json::to_value(value)?)
}

fn empty_result() -> Value {
    json!({})
}

// ============================================================================
// Router
// ============================================================================

pub struct Router {
    browser: Arc<dyn Browser>,
    fetcher: Arc<dyn HttpFetcher>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    #[must_use]
    pub fn new(browser: Arc<dyn Browser>, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self { browser, fetcher }
    }

    /// Handles one inbound request. Returns the correlated response, or
    /// `None` for a notification.
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let span = logging::request_span(request.id.as_deref().unwrap_or("-"), &request.method);
        async move {
            let outcome = self.handle(&request.method, request.params).await;
            match (request.id, outcome) {
                (Some(id), Ok(result)) => Some(RpcResponse::success(id, result)),
                (Some(id), Err(err)) => {
                    tracing::debug!(code = err.code(), "capability call failed: {err}");
                    Some(RpcResponse::failure(id, err.to_rpc_error()))
                }
                (None, Ok(_)) => None,
                (None, Err(err)) => {
                    tracing::warn!(method = %request.method, "notification failed: {err}");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, name: &str, params: Option<Value>) -> Result<Value, CapabilityError> {
        let Some(Value::Array(params)) = params else {
            return Err(CapabilityError::ParamsNotArray);
        };
        let method =
            Method::from_name(name).ok_or_else(|| CapabilityError::MethodNotFound(name.to_string()))?;
        let args = Params(params);
        let browser = self.browser.as_ref();

        match method {
            Method::TabsQuery => encode(&browser.query_tabs(args.or_default::<TabQuery>(0, "queryInfo")?).await?),
            Method::TabsGet => {
                let (tab_id, _) = self.target_tab(&args).await?;
                encode(&browser.get_tab(tab_id).await?)
            }
            Method::TabsCreate => {
                let properties: CreateTabProperties = args.or_default(0, "createProperties")?;
                encode(&browser.create_tab(properties).await?)
            }
            Method::TabsDuplicate => {
                let (tab_id, _) = self.target_tab(&args).await?;
                encode(&browser.duplicate_tab(tab_id).await?)
            }
            Method::TabsDiscard => {
                let (tab_id, _) = self.target_tab(&args).await?;
                browser.discard_tab(tab_id).await?;
                Ok(empty_result())
            }
            Method::TabsRemove => {
                let tab_ids = match args.optional::<OneOrMany<i64>>(0, "tabIds")? {
                    Some(tab_ids) => tab_ids.into_vec(),
                    None => vec![self.active_tab_id().await?],
                };
                browser.remove_tabs(tab_ids).await?;
                Ok(empty_result())
            }
            Method::TabsCaptureVisibleTab => {
                let window_id = args.get(0).and_then(Value::as_i64);
                let data_url = browser.capture_visible_tab(window_id).await?;
                Ok(json!({ "dataUrl": data_url }))
            }
            Method::TabsUpdate => {
                let (tab_id, next) = self.target_tab(&args).await?;
                let properties: UpdateTabProperties = args.or_default(next, "updateProperties")?;
                encode(&browser.update_tab(tab_id, properties).await?)
            }
            Method::TabsReload => {
                let (tab_id, next) = self.target_tab(&args).await?;
                let properties: ReloadProperties = args.or_default(next, "reloadProperties")?;
                browser.reload_tab(tab_id, properties).await?;
                Ok(empty_result())
            }
            Method::TabsGoForward => {
                let (tab_id, _) = self.target_tab(&args).await?;
                browser.go_forward(tab_id).await?;
                Ok(empty_result())
            }
            Method::TabsGoBack => {
                let (tab_id, _) = self.target_tab(&args).await?;
                browser.go_back(tab_id).await?;
                Ok(empty_result())
            }
            Method::TabsPrint => {
                let (tab_id, _) = self.target_tab(&args).await?;
                let html = browser
                    .page_html(tab_id)
                    .await
                    .map_err(CapabilityError::PageContent)?;
                Ok(json!({ "html": html }))
            }
            Method::WindowsGetAll => encode(&browser.all_windows().await?),
            Method::WindowsGet => {
                let window_id: i64 = args.required(0, "windowId")?;
                encode(&browser.get_window(window_id).await?)
            }
            Method::WindowsGetCurrent => encode(&browser.current_window().await?),
            Method::WindowsGetLastFocused => encode(&browser.last_focused_window().await?),
            Method::WindowsCreate => {
                let data: CreateWindowData = args.or_default(0, "createData")?;
                encode(&browser.create_window(data).await?)
            }
            Method::WindowsRemove => {
                let window_id: i64 = args.required(0, "windowId")?;
                browser.remove_window(window_id).await?;
                Ok(empty_result())
            }
            Method::WindowsUpdate => {
                let window_id: i64 = args.required(0, "windowId")?;
                let info: UpdateWindowInfo = args.or_default(1, "updateInfo")?;
                encode(&browser.update_window(window_id, info).await?)
            }
            Method::HistorySearch => {
                let query: HistoryQuery = args.required(0, "query")?;
                encode(&browser.search_history(query).await?)
            }
            Method::BookmarksGetTree => encode(&browser.bookmark_tree().await?),
            Method::BookmarksGetRecent => {
                let count: usize = args.required(0, "numberOfItems")?;
                encode(&browser.recent_bookmarks(count).await?)
            }
            Method::BookmarksSearch => {
                let query: BookmarkQuery = args.required(0, "query")?;
                encode(&browser.search_bookmarks(query).await?)
            }
            Method::BookmarksCreate => {
                let bookmark: CreateBookmark = args.required(0, "bookmark")?;
                encode(&browser.create_bookmark(bookmark).await?)
            }
            Method::BookmarksUpdate => {
                let id = args.bookmark_id(0)?;
                let changes: BookmarkChanges = args.required(1, "changes")?;
                encode(&browser.update_bookmark(&id, changes).await?)
            }
            Method::BookmarksRemove => {
                let id = args.bookmark_id(0)?;
                browser.remove_bookmark(&id).await?;
                Ok(empty_result())
            }
            Method::NotificationsCreate => {
                let (id, options) = match args.len() {
                    2 => (
                        Some(args.required::<String>(0, "notificationId")?),
                        args.required::<NotificationOptions>(1, "options")?,
                    ),
                    1 => (None, args.required::<NotificationOptions>(0, "options")?),
                    _ => {
                        return Err(CapabilityError::InvalidParams(
                            "Invalid params for notifications.create".to_string(),
                        ));
                    }
                };
                let notification_id = browser.create_notification(id, options).await?;
                Ok(json!({ "notificationId": notification_id }))
            }
            Method::Fetch => {
                let url: String = args.required(0, "url")?;
                let init: FetchInit = args.or_default(1, "init")?;
                encode(&self.fetcher.fetch(&url, init).await?)
            }
            Method::CommandsUpdate => {
                let commands: Vec<CommandSpec> = args.or_default(0, "commands")?;
                tracing::info!(count = commands.len(), "updating command menus");
                browser
                    .set_context_menus(context_menu_items(&commands))
                    .await?;
                Ok(empty_result())
            }
        }
    }

    /// Tab argument at position 0, or the active tab of the last-focused
    /// window when it is omitted. Also returns where the remaining args start.
    async fn target_tab(&self, args: &Params) -> Result<(i64, usize), CapabilityError> {
        match args.0.first() {
            Some(Value::Number(id)) => id.as_i64().map(|id| (id, 1)).ok_or_else(|| {
                CapabilityError::InvalidParams("Invalid params: tabId must be an integer".to_string())
            }),
            None | Some(Value::Null) => Ok((self.active_tab_id().await?, 1)),
            Some(Value::Object(_)) => Ok((self.active_tab_id().await?, 0)),
            Some(_) => Err(CapabilityError::InvalidParams(
                "Invalid params: tabId must be an integer".to_string(),
            )),
        }
    }

    async fn active_tab_id(&self) -> Result<i64, CapabilityError> {
        let tabs = self.browser.query_tabs(TabQuery::active_tab()).await?;
        tabs.first()
            .map(|tab| tab.id)
            .ok_or(CapabilityError::NoActiveTab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fetch::FetchResponse;
    use crate::bridge::memory_browser::MemoryBrowser;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct CannedFetcher;

    #[async_trait]
    impl HttpFetcher for CannedFetcher {
        async fn fetch(&self, url: &str, _init: FetchInit) -> Result<FetchResponse, FetchError> {
            if url.starts_with("https://") {
                Ok(FetchResponse {
                    status: 200,
                    headers: BTreeMap::new(),
                    body: "aGk=".to_string(),
                })
            } else {
                Err(FetchError::UnsupportedScheme("ftp".to_string()))
            }
        }
    }

    fn router() -> (Router, Arc<MemoryBrowser>) {
        let browser = Arc::new(MemoryBrowser::new());
        (Router::new(browser.clone(), Arc::new(CannedFetcher)), browser)
    }

    async fn call(router: &Router, method: &str, params: Value) -> RpcResponse {
        router
            .dispatch(RpcRequest::new("h1", method, params))
            .await
            .expect("request gets a response")
    }

    #[test]
    fn method_table_round_trips() {
        assert_eq!(Method::all().count(), METHOD_NAMES.len());
        for method in Method::all() {
            assert_eq!(Method::from_name(method.name()), Some(method));
        }
        assert_eq!(Method::from_name("tabs.executeScript"), None);
    }

    #[tokio::test]
    async fn non_array_params_are_rejected_first() {
        let (router, _) = router();
        let response = call(&router, "nope.method", json!({"a": 1})).await;
        let error = response.error().expect("error");
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.message, "Invalid params: expected an array");

        let response = router
            .dispatch(RpcRequest {
                params: None,
                ..RpcRequest::new("h2", "tabs.query", json!([]))
            })
            .await
            .expect("response");
        assert_eq!(response.error().map(|e| e.code), Some(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let (router, _) = router();
        let response = call(&router, "tabs.executeScript", json!([])).await;
        assert_eq!(
            response.error(),
            Some(&RpcErrorObject::new(METHOD_NOT_FOUND, "Method not found: tabs.executeScript"))
        );
    }

    #[tokio::test]
    async fn notifications_never_get_responses() {
        let (router, browser) = router();
        let response = router
            .dispatch(RpcRequest::notification("tabs.get", json!([])))
            .await;
        assert!(response.is_none(), "failed notification stays silent");

        browser.open_window(&["https://a.example/"]);
        let response = router
            .dispatch(RpcRequest::notification("tabs.create", json!([{"url": "https://b.example/"}])))
            .await;
        assert!(response.is_none());
        assert_eq!(browser.tab_count(), 2, "notification side effect applied");
    }

    #[tokio::test]
    async fn tab_methods_fall_back_to_active_tab() {
        let (router, browser) = router();
        let response = call(&router, "tabs.get", json!([])).await;
        assert_eq!(
            response.error(),
            Some(&RpcErrorObject::new(INVALID_PARAMS, "No active tab found"))
        );

        browser.open_window(&["https://a.example/", "https://b.example/"]);
        let tab = call(&router, "tabs.get", json!([])).await.into_result().expect("tab");
        assert_eq!(tab["url"], json!("https://a.example/"));

        let updated = call(&router, "tabs.update", json!([{"url": "https://c.example/"}]))
            .await
            .into_result()
            .expect("update active tab");
        assert_eq!(updated["id"], tab["id"]);
        assert_eq!(updated["url"], json!("https://c.example/"));

        let back = call(&router, "tabs.goBack", json!([])).await;
        assert_eq!(back.result(), Some(&json!({})), "void results are objects");

        let printed = call(&router, "tabs.print", json!([tab["id"]])).await;
        let html = printed.result().and_then(|r| r["html"].as_str()).expect("html");
        assert!(html.contains("<title>a.example</title>"), "{html}");
    }

    #[tokio::test]
    async fn handler_failures_use_internal_error() {
        let (router, _) = router();
        let response = call(&router, "tabs.get", json!([404])).await;
        assert_eq!(
            response.error(),
            Some(&RpcErrorObject::new(INTERNAL_ERROR, "No tab with id: 404."))
        );

        let response = call(&router, "tabs.print", json!([404])).await;
        assert_eq!(
            response.error().map(|e| e.message.as_str()),
            Some("Failed to get tab content: No tab with id: 404.")
        );
    }

    #[tokio::test]
    async fn notifications_create_accepts_one_or_two_params() {
        let (router, browser) = router();
        let options = json!({"type": "basic", "title": "T", "message": "M"});

        let named = call(&router, "notifications.create", json!(["n1", options])).await;
        assert_eq!(named.result(), Some(&json!({"notificationId": "n1"})));

        let anonymous = call(&router, "notifications.create", json!([options])).await;
        assert!(anonymous.result().is_some_and(|r| r["notificationId"].is_string()));

        let bad = call(&router, "notifications.create", json!([])).await;
        assert_eq!(
            bad.error(),
            Some(&RpcErrorObject::new(INVALID_PARAMS, "Invalid params for notifications.create"))
        );
        assert_eq!(browser.notifications().len(), 2);
    }

    #[tokio::test]
    async fn fetch_results_and_failures() {
        let (router, _) = router();
        let ok = call(&router, "fetch", json!(["https://example.com/", {"method": "GET"}])).await;
        assert_eq!(
            ok.result(),
            Some(&json!({"status": 200, "headers": {}, "body": "aGk="}))
        );

        let failed = call(&router, "fetch", json!(["ftp://example.com/"])).await;
        let error = failed.error().expect("error");
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.starts_with("Fetch failed: "), "{}", error.message);
    }

    #[tokio::test]
    async fn commands_update_rebuilds_menus() {
        let (router, browser) = router();
        let response = call(
            &router,
            "commands.update",
            json!([[{"id": "ls", "meta": {"title": "List", "contexts": ["page"]}}]]),
        )
        .await;
        assert_eq!(response.result(), Some(&json!({})));
        let ids: Vec<String> = browser.context_menus().into_iter().map(|item| item.id).collect();
        assert_eq!(ids, ["openInNewTab", "openInNewWindow", "runCommand", "commands:ls"]);

        call(&router, "commands.update", json!([[]])).await;
        assert_eq!(browser.context_menus().len(), 2);
    }

    #[tokio::test]
    async fn wrong_param_types_are_invalid_params() {
        let (router, _) = router();
        let response = call(&router, "windows.get", json!(["one"])).await;
        let error = response.error().expect("error");
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.message.starts_with("Invalid params: windowId"), "{}", error.message);
    }
}
