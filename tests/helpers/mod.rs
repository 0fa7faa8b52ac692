//! Scripted transport and page fixtures for driving `CtmsApi` without a relay.

#![allow(dead_code)]

use async_trait::async_trait;
use ctms::ctms::relay::{RelayRequest, RelayResponse, RequestBody, Transport};
use ctms::ctms::{CtmsApi, TransportFailure};
use ctms::data::kv::KvStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays queued replies in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<RelayResponse, TransportFailure>>>,
    sent: Mutex<Vec<RelayRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, body: impl Into<String>) {
        self.push(Ok(response(body, None)));
    }

    pub fn push_page_with_session(&self, body: impl Into<String>, session: &str) {
        self.push(Ok(response(body, Some(session))));
    }

    pub fn push_failure(&self, failure: TransportFailure) {
        self.push(Err(failure));
    }

    fn push(&self, reply: Result<RelayResponse, TransportFailure>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<RelayRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> RelayRequest {
        self.sent
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request was sent")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: RelayRequest) -> Result<RelayResponse, TransportFailure> {
        self.sent.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportFailure::Unreachable(anyhow::anyhow!("script exhausted"))))
    }
}

fn response(body: impl Into<String>, session: Option<&str>) -> RelayResponse {
    RelayResponse {
        status: 200,
        body: body.into(),
        session: session.map(str::to_owned),
        runtime: Duration::from_millis(20),
    }
}

/// A client over `transport` with an in-memory store.
pub async fn client(transport: &Arc<ScriptedTransport>) -> (CtmsApi, Arc<KvStore>) {
    let store = Arc::new(KvStore::in_memory());
    let api = CtmsApi::new(transport.clone(), store.clone()).await;
    (api, store)
}

/// A page carrying the three postback tokens around `content`.
pub fn page(tokens: &str, content: &str) -> String {
    format!(
        r#"<html><body><form>
            <input type="hidden" id="__VIEWSTATE" value="vs-{tokens}" />
            <input type="hidden" id="__VIEWSTATEGENERATOR" value="gen-{tokens}" />
            <input type="hidden" id="__EVENTVALIDATION" value="ev-{tokens}" />
            {content}
        </form></body></html>"#
    )
}

/// A page without any postback tokens.
pub fn bare_page(content: &str) -> String {
    format!("<html><body>{content}</body></html>")
}

pub fn no_permission_page() -> String {
    bare_page(r#"<div class="NoPermission">Bạn không có quyền truy cập</div>"#)
}

/// Value of a form field in a recorded request.
pub fn form_value<'a>(request: &'a RelayRequest, name: &str) -> Option<&'a str> {
    match &request.body {
        RequestBody::Form(fields) => fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str()),
        _ => None,
    }
}
