//! Lazy cursor-based pagination over list requests
//!
//! A [`PageStream`] is forward-only and non-restartable: each page is
//! requested only when asked for, carrying the prior page's opaque cursor.
//! Dropping the stream simply abandons the remaining pages.

use crate::correlator::RequestCorrelator;
use crate::utils::errors::{McpError, McpResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Extractor<T> = Box<dyn Fn(&Value) -> McpResult<Vec<T>> + Send>;

pub struct PageStream<T> {
    correlator: Arc<RequestCorrelator>,
    method: String,
    base_params: Map<String, Value>,
    extract: Extractor<T>,
    cursor: Option<String>,
    done: bool,
    cancel: CancellationToken,
}

impl<T> PageStream<T> {
    pub(crate) fn new(
        correlator: Arc<RequestCorrelator>,
        method: impl Into<String>,
        params: Option<Value>,
        extract: Extractor<T>,
        cancel: CancellationToken,
    ) -> Self {
        let base_params = match params {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            correlator,
            method: method.into(),
            base_params,
            extract,
            cursor: None,
            done: false,
            cancel,
        }
    }

    /// Fetch the next page, or `None` once the server omits `nextCursor`.
    /// A failed or cancelled fetch terminates the stream.
    pub async fn next_page(&mut self) -> McpResult<Option<Vec<T>>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Err(McpError::Cancelled);
        }

        let mut params = self.base_params.clone();
        if let Some(cursor) = &self.cursor {
            params.insert("cursor".to_string(), Value::String(cursor.clone()));
        }

        let result = match self
            .correlator
            .send_request(&self.method, Some(Value::Object(params)), &self.cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        let items = (self.extract)(&result)?;
        match result.get("nextCursor").and_then(Value::as_str) {
            Some(next) => self.cursor = Some(next.to_string()),
            None => self.done = true,
        }
        Ok(Some(items))
    }

    /// Drain the remaining pages in order into one vector.
    pub async fn collect(mut self) -> McpResult<Vec<T>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

impl<T: DeserializeOwned> PageStream<T> {
    /// Stream over a standard list endpoint whose result carries the items
    /// under `items_key`.
    pub(crate) fn list(
        correlator: Arc<RequestCorrelator>,
        method: impl Into<String>,
        params: Option<Value>,
        items_key: &'static str,
        cancel: CancellationToken,
    ) -> Self {
        let extract: Extractor<T> = Box::new(move |result| {
            let items = result.get(items_key).cloned().unwrap_or(Value::Array(vec![]));
            serde_json::from_value(items).map_err(McpError::from)
        });
        Self::new(correlator, method, params, extract, cancel)
    }
}
