//! Postback state and account session for the CTMS client.
//!
//! CTMS is an ASP.NET WebForms application: every POST must echo back the
//! `__VIEWSTATE`, `__VIEWSTATEGENERATOR` and `__EVENTVALIDATION` tokens of the
//! page it was rendered from. One global context tracks the most recent page.
//! Each feature flow (schedule, exams, subscription, logout) additionally keeps
//! its own snapshot, so a flow keeps posting against its own page even while
//! unrelated requests move the global context on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use super::errors::CtmsError;
use super::markup::Document;
use crate::data::kv::{KV_SESSION, KvStore};

pub const VIEWSTATE: &str = "__VIEWSTATE";
pub const VIEWSTATE_GENERATOR: &str = "__VIEWSTATEGENERATOR";
pub const EVENT_VALIDATION: &str = "__EVENTVALIDATION";
pub const EVENT_TARGET: &str = "__EVENTTARGET";
pub const EVENT_ARGUMENT: &str = "__EVENTARGUMENT";
pub const CALLBACK_ID: &str = "__CALLBACKID";
pub const CALLBACK_PARAM: &str = "__CALLBACKPARAM";

/// Ordered form fields of an outgoing postback.
pub type FormFields = Vec<(String, String)>;

/// One snapshot of the portal's opaque postback state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostbackContext {
    pub view_state: Option<String>,
    pub view_state_generator: Option<String>,
    pub event_validation: Option<String>,
}

impl PostbackContext {
    /// Read the hidden token inputs of a page. Absent or empty inputs stay `None`.
    pub fn from_document(doc: &Document) -> Self {
        let read = |id: &str| doc.input_value(id).filter(|v| !v.is_empty());
        Self {
            view_state: read(VIEWSTATE),
            view_state_generator: read(VIEWSTATE_GENERATOR),
            event_validation: read(EVENT_VALIDATION),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.view_state.is_none()
            && self.view_state_generator.is_none()
            && self.event_validation.is_none()
    }

    /// Overwrite fields for which `newer` carries a value; keep the rest.
    fn merge(&mut self, newer: PostbackContext) {
        if let Some(v) = newer.view_state {
            self.view_state = Some(v);
        }
        if let Some(v) = newer.view_state_generator {
            self.view_state_generator = Some(v);
        }
        if let Some(v) = newer.event_validation {
            self.event_validation = Some(v);
        }
    }

    fn fields(&self) -> [(&'static str, Option<&str>); 3] {
        [
            (VIEWSTATE, self.view_state.as_deref()),
            (VIEWSTATE_GENERATOR, self.view_state_generator.as_deref()),
            (EVENT_VALIDATION, self.event_validation.as_deref()),
        ]
    }
}

/// Merge a context's tokens, the event target/argument and caller fields into one form body.
///
/// Caller fields come first and win: a token the caller already set is not
/// overwritten by the context.
pub fn build_postback(
    context: &PostbackContext,
    target: &str,
    argument: &str,
    extra: &[(String, String)],
) -> FormFields {
    let mut params: FormFields = extra.to_vec();

    let mut set_if_absent = |name: &str, value: &str| {
        if !params.iter().any(|(n, _)| n == name) {
            params.push((name.to_owned(), value.to_owned()));
        }
    };

    for (name, value) in context.fields() {
        if let Some(value) = value {
            set_if_absent(name, value);
        }
    }

    // The event target and argument always reflect this call.
    params.retain(|(n, _)| n != EVENT_TARGET && n != EVENT_ARGUMENT);
    params.push((EVENT_TARGET.to_owned(), target.to_owned()));
    params.push((EVENT_ARGUMENT.to_owned(), argument.to_owned()));

    params
}

/// Feature flows that keep their own postback snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Schedule,
    Exams,
    Subscription,
    Logout,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::Schedule,
        Feature::Exams,
        Feature::Subscription,
        Feature::Logout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Schedule => "schedule",
            Feature::Exams => "exams",
            Feature::Subscription => "subscription",
            Feature::Logout => "logout",
        }
    }
}

/// A feature's snapshot plus the lock that serializes that feature's flows.
#[derive(Default)]
struct FeatureSlot {
    flow: tokio::sync::Mutex<()>,
    context: Mutex<Option<PostbackContext>>,
}

/// Owns the session token, the global context and every feature snapshot.
pub struct SessionManager {
    store: Arc<KvStore>,
    token: RwLock<Option<String>>,
    global: Mutex<PostbackContext>,
    features: HashMap<Feature, FeatureSlot>,
    /// Week start the schedule page was last rendered for, as the portal formats it.
    schedule_date: Mutex<Option<String>>,
    /// Numeric student id learned from the subscription bootstrap page.
    student_id: Mutex<Option<u64>>,
}

impl SessionManager {
    /// Create a manager, hydrating the session token from `store`.
    pub async fn load(store: Arc<KvStore>) -> Self {
        let token = store.get(KV_SESSION).await.filter(|t| !t.is_empty());
        debug!(has_session = token.is_some(), "Session hydrated from store");

        Self {
            store,
            token: RwLock::new(token),
            global: Mutex::new(PostbackContext::default()),
            features: Feature::ALL
                .into_iter()
                .map(|f| (f, FeatureSlot::default()))
                .collect(),
            schedule_date: Mutex::new(None),
            student_id: Mutex::new(None),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the session token and persist it.
    pub async fn set_token(&self, token: &str) {
        let value = (!token.is_empty()).then(|| token.to_owned());
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = value;
        if let Err(e) = self.store.set(KV_SESSION, token).await {
            warn!(error = ?e, "Failed to persist session token");
        }
    }

    pub async fn clear_token(&self) {
        self.set_token("").await;
    }

    pub fn global(&self) -> PostbackContext {
        self.global.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fold the page's hidden tokens into the global context and return the result.
    ///
    /// Empty or missing tokens never erase a previously known value.
    pub fn capture_global(&self, doc: &Document) -> PostbackContext {
        let found = PostbackContext::from_document(doc);
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if !found.is_empty() {
            debug!(
                view_state = found.view_state.is_some(),
                generator = found.view_state_generator.is_some(),
                validation = found.event_validation.is_some(),
                "Updating global postback context"
            );
        }
        global.merge(found);
        global.clone()
    }

    /// Copy the current global context into a feature slot.
    pub fn snapshot(&self, feature: Feature) {
        let global = self.global();
        self.store_feature(feature, global);
    }

    /// Store a specific context into a feature slot.
    pub fn store_feature(&self, feature: Feature, context: PostbackContext) {
        debug!(feature = feature.as_str(), "Capturing feature postback context");
        *self.slot(feature).context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context);
    }

    /// The feature's snapshot, or `None` if the feature has not been visited.
    pub fn restore(&self, feature: Feature) -> Option<PostbackContext> {
        self.slot(feature)
            .context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Serialize flows of one feature. Different features never contend.
    pub async fn lock_flow(&self, feature: Feature) -> tokio::sync::MutexGuard<'_, ()> {
        self.slot(feature).flow.lock().await
    }

    pub fn schedule_date(&self) -> Option<String> {
        self.schedule_date
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_schedule_date(&self, date: Option<String>) {
        *self.schedule_date.lock().unwrap_or_else(|e| e.into_inner()) = date;
    }

    pub fn student_id(&self) -> Option<u64> {
        *self.student_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_student_id(&self, id: u64) {
        *self.student_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    /// Forget the session token and every piece of postback state.
    pub async fn reset(&self) {
        self.clear_token().await;
        *self.global.lock().unwrap_or_else(|e| e.into_inner()) = PostbackContext::default();
        for slot in self.features.values() {
            *slot.context.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        self.set_schedule_date(None);
        *self.student_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        debug!("Session state reset");
    }

    fn slot(&self, feature: Feature) -> &FeatureSlot {
        // Every feature is inserted at construction.
        &self.features[&feature]
    }
}

/// Validate that a POST actually carries form fields.
pub(crate) fn require_form(path: &str, form: Option<&FormFields>) -> Result<(), CtmsError> {
    match form {
        Some(_) => Ok(()),
        None => Err(CtmsError::precondition(format!(
            "POST {path} requires form fields"
        ))),
    }
}
