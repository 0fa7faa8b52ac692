//! Request orchestration and the feature flows built on it.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use http::Method;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::errors::{CtmsError, TransportFailure};
use super::events::{Event, EventKind, EventRegistry};
use super::markup::{self, Document};
use super::models::exams::{self, ExamFilter, ExamRecord};
use super::models::grades::{self, ResultsReport};
use super::models::schedule::{self, Note, WeeklySchedule};
use super::models::services::{self, ServicesReport};
use super::models::subscription::{self, SubscriptionCommand, SubscriptionPage};
use super::relay::{RelayRequest, RequestBody, Transport};
use super::session::{
    CALLBACK_ID, CALLBACK_PARAM, Feature, FormFields, PostbackContext, SessionManager,
    build_postback, require_form,
};
use crate::data::kv::KvStore;
use crate::utils::{log_if_slow, md5_hex};

const HOME_PATH: &str = "";
const LOGIN_PATH: &str = "/login.aspx";
const RESULTS_PATH: &str = "/KetquaHoctap.aspx";
const SERVICES_PATH: &str = "/services/BuyServices.aspx";
const SCHEDULE_PATH: &str = "/Lichhoc.aspx";
const EXAMS_PATH: &str = "/Lichthi.aspx";
const SUBSCRIPTION_PATH: &str = "/DangkyLoptinchi.aspx";

const NO_PERMISSION_CLASS: &str = "NoPermission";
const PASSWORD_CHANGE_MARKER: &str = "LeftCol_UsersChangePassword1_lblUser";
const ANNOUNCEMENT_ID: &str = "thongbao";
const LOGIN_PANEL_ID: &str = "LeftCol_UserLogin1_pnlLogin";
const LOGIN_MESSAGE_ID: &str = "LeftCol_UserLogin1_lblMess";
const ONLINE_COUNTER_ID: &str = "menubottom";
const MAINTENANCE_STATUS: u16 = 503;

const USERNAME_FIELD: &str = "ctl00$LeftCol$UserLogin1$txtUsername";
const PASSWORD_FIELD: &str = "ctl00$LeftCol$UserLogin1$txtPassword";
const LOGIN_BUTTON_FIELD: &str = "ctl00$LeftCol$UserLogin1$btnLogin";
const LOGIN_BUTTON_LABEL: &str = "Đăng nhập";

const LOGOUT_CALLBACK: &str = "ctl00$QuanlyMenu1";

const WEEK_START_FIELD: &str = "ctl00$LeftCol$Lichhoc1$txtNgaydautuan";
const SHOW_SCHEDULE_FIELD: &str = "ctl00$LeftCol$Lichhoc1$btnXemlich";
const SHOW_SCHEDULE_LABEL: &str = "Xem lịch";
const NOTE_CALLBACK: &str = "ctl00$LeftCol$Lichhoc1";

/// Requests slower than this end to end are logged at `warn`.
const SLOW_REQUEST: Duration = Duration::from_secs(3);

static FIRST_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// A successfully classified portal response.
#[derive(Debug)]
pub struct Envelope {
    pub path: String,
    pub method: Method,
    pub status: u16,
    pub body: String,
    pub document: Document,
    /// Session token the relay handed back with this response, if any.
    pub session: Option<String>,
    /// Global postback context right after this response was captured.
    pub context: PostbackContext,
    /// Client-to-relay overhead.
    pub c2m: Duration,
    /// Relay-to-portal latency reported by the relay.
    pub m2s: Duration,
}

impl Envelope {
    /// Users online, from the page footer.
    pub fn online_count(&self) -> Option<u32> {
        let footer = self.document.text_by_id(ONLINE_COUNTER_ID)?;
        FIRST_NUMBER_RE.find(&footer)?.as_str().parse().ok()
    }

    /// Whether the page still shows the login panel.
    pub fn shows_login_panel(&self) -> bool {
        self.document.by_id(LOGIN_PANEL_ID).is_some()
    }
}

/// Description of one page request, before postback fields are filled in.
#[derive(Debug, Clone)]
pub struct PageRequest {
    path: String,
    method: Method,
    form: Option<FormFields>,
    json: Option<Value>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    target: String,
    argument: String,
    context: Option<PostbackContext>,
    renew: bool,
    quiet: bool,
}

impl PageRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            form: None,
            json: None,
            query: Vec::new(),
            headers: Vec::new(),
            target: String::new(),
            argument: String::new(),
            context: None,
            renew: false,
            quiet: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, form: FormFields) -> Self {
        Self {
            form: Some(form),
            ..Self::new(Method::POST, path)
        }
    }

    /// Post back with a feature snapshot instead of the global context.
    pub fn with_context(mut self, context: PostbackContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn target(mut self, target: impl Into<String>, argument: impl Into<String>) -> Self {
        self.target = target.into();
        self.argument = argument.into();
        self
    }

    /// On a no-permission page, drop the session and retry once.
    pub fn renew(mut self) -> Self {
        self.renew = true;
        self
    }

    /// Do not surface the page's announcement.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.json = Some(value);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_home(&self) -> bool {
        self.path.is_empty() || self.path == "/"
    }
}

/// Receives portal announcements (`#thongbao`) before the request completes.
#[async_trait]
pub trait AnnouncementSink: Send + Sync {
    async fn announce(&self, path: &str, message: &str);
}

/// Default sink: write the announcement to the log.
pub struct LogAnnouncements;

#[async_trait]
impl AnnouncementSink for LogAnnouncements {
    async fn announce(&self, path: &str, message: &str) {
        info!(path, message, "CTMS announcement");
    }
}

/// Stateful CTMS client.
///
/// All feature flows share one account session. Each flow with its own
/// postback snapshot is serialized behind that feature's lock; different
/// features may run concurrently.
pub struct CtmsApi {
    transport: Arc<dyn Transport>,
    session: SessionManager,
    events: EventRegistry,
    announcements: Arc<dyn AnnouncementSink>,
    logged_in: AtomicBool,
}

impl CtmsApi {
    pub async fn new(transport: Arc<dyn Transport>, store: Arc<KvStore>) -> Self {
        Self {
            transport,
            session: SessionManager::load(store).await,
            events: EventRegistry::new(),
            announcements: Arc::new(LogAnnouncements),
            logged_in: AtomicBool::new(false),
        }
    }

    pub fn with_announcements(mut self, sink: Arc<dyn AnnouncementSink>) -> Self {
        self.announcements = sink;
        self
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Whether the last page seen was rendered for a signed-in account.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Relaxed)
    }

    /// Run one full request cycle: send, classify, update state, publish.
    ///
    /// A no-permission page on a renewable request clears the session token and
    /// retries exactly once.
    pub async fn request(&self, request: PageRequest) -> Result<Envelope, CtmsError> {
        let mut renew = request.renew;

        loop {
            let start = Instant::now();
            let relay_request = self.build_relay_request(&request)?;

            let response = match self.transport.send(relay_request).await {
                Ok(response) => response,
                Err(failure) => {
                    let c2m = start
                        .elapsed()
                        .saturating_sub(failure.runtime().unwrap_or_default());
                    return Err(self.fail(classify_failure(failure, c2m)));
                }
            };

            let c2m = start.elapsed().saturating_sub(response.runtime);
            if let Some(token) = &response.session {
                debug!(path = request.path, "Relay supplied a new session token");
                self.session.set_token(token).await;
            }

            let document = Document::parse(&response.body);

            if document.has_class(NO_PERMISSION_CLASS) {
                if renew {
                    warn!(path = request.path, "Session expired, requesting a new session");
                    self.session.clear_token().await;
                    renew = false;
                    continue;
                }
                // Terminal expiry: later requests must not replay the dead token.
                self.session.clear_token().await;
                return Err(self.fail(CtmsError::SessionExpired { c2m }));
            }

            if document.by_id(PASSWORD_CHANGE_MARKER).is_some() {
                return Err(self.fail(CtmsError::PolicyBlocked { c2m }));
            }

            let context = self.session.capture_global(&document);
            if request.is_home() {
                self.session.store_feature(Feature::Logout, context.clone());
            }

            let announcement = (!request.quiet)
                .then(|| document.by_id(ANNOUNCEMENT_ID).map(markup::collapsed_text))
                .flatten();
            if let Some(message) = announcement {
                self.announcements.announce(&request.path, &message).await;
            }

            self.logged_in
                .store(document.by_id(LOGIN_PANEL_ID).is_none(), Ordering::Relaxed);

            let envelope = Envelope {
                path: request.path.clone(),
                method: request.method.clone(),
                status: response.status,
                body: response.body,
                document,
                session: response.session,
                context,
                c2m,
                m2s: response.runtime,
            };

            log_if_slow(start, SLOW_REQUEST, &request.path);
            debug!(
                method = %envelope.method,
                path = envelope.path,
                status = envelope.status,
                c2m = ?envelope.c2m,
                m2s = ?envelope.m2s,
                "Request completed"
            );
            self.events
                .publish(EventKind::Global, Event::Envelope(&envelope));
            return Ok(envelope);
        }
    }

    fn build_relay_request(&self, request: &PageRequest) -> Result<RelayRequest, CtmsError> {
        let body = if let Some(json) = &request.json {
            RequestBody::Json(json.clone())
        } else if request.method == Method::POST {
            require_form(&request.path, request.form.as_ref())?;
            let context = request
                .context
                .clone()
                .unwrap_or_else(|| self.session.global());
            RequestBody::Form(build_postback(
                &context,
                &request.target,
                &request.argument,
                request.form.as_deref().unwrap_or_default(),
            ))
        } else {
            RequestBody::None
        };

        Ok(RelayRequest {
            path: request.path.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            body,
            session_token: self.session.token(),
        })
    }

    /// Log and publish a request failure, handing it back for propagation.
    fn fail(&self, error: CtmsError) -> CtmsError {
        warn!(kind = ?error.kind(), c2m = ?error.c2m(), error = %error, "Request failed");
        self.events.publish(EventKind::Error, Event::Error(&error));
        error
    }

    /// Fetch the home page. A stale session is replaced by a fresh one.
    pub async fn home(&self) -> Result<Envelope, CtmsError> {
        self.request(PageRequest::get(HOME_PATH).renew()).await
    }

    /// Sign in. The password is sent as its md5 hex digest, as the portal expects.
    pub async fn login(&self, username: &str, password: &str) -> Result<Envelope, CtmsError> {
        if username.is_empty() || password.is_empty() {
            return Err(CtmsError::precondition("username and password are required"));
        }

        if self.session.global().is_empty() {
            debug!("No postback context yet, fetching the home page first");
            self.home().await?;
        }

        let form = vec![
            (USERNAME_FIELD.to_owned(), username.to_owned()),
            (PASSWORD_FIELD.to_owned(), md5_hex(password)),
            (LOGIN_BUTTON_FIELD.to_owned(), LOGIN_BUTTON_LABEL.to_owned()),
        ];
        let envelope = self.request(PageRequest::post(LOGIN_PATH, form)).await?;

        if envelope.shows_login_panel() {
            let message = envelope
                .document
                .text_by_id(LOGIN_MESSAGE_ID)
                .filter(|m| !m.is_empty());
            if let Some(message) = message {
                return Err(CtmsError::SubmissionRejected(message));
            }
        } else {
            info!(username, "Signed in");
        }

        self.events
            .publish(EventKind::Login, Event::Envelope(&envelope));
        Ok(envelope)
    }

    /// Sign out using the tokens captured from the last home page visit, then reset all state.
    pub async fn logout(&self) -> Result<Envelope, CtmsError> {
        let _flow = self.session.lock_flow(Feature::Logout).await;
        let context = self.session.restore(Feature::Logout).ok_or_else(|| {
            CtmsError::precondition("cannot sign out before the home page has been loaded")
        })?;

        let form = vec![
            (CALLBACK_ID.to_owned(), LOGOUT_CALLBACK.to_owned()),
            (CALLBACK_PARAM.to_owned(), "logout".to_owned()),
        ];
        let envelope = self
            .request(PageRequest::post(HOME_PATH, form).with_context(context))
            .await?;

        self.session.reset().await;
        self.logged_in.store(false, Ordering::Relaxed);
        info!("Signed out");

        self.events
            .publish(EventKind::Logout, Event::Envelope(&envelope));
        Ok(envelope)
    }

    pub async fn results(&self) -> Result<ResultsReport, CtmsError> {
        let envelope = self.request(PageRequest::get(RESULTS_PATH)).await?;
        let report = grades::parse_results(&envelope.document);
        debug!(
            subjects = report.results.len(),
            cumulative = report.cumulative,
            "Parsed study results"
        );

        self.events
            .publish(EventKind::Results, Event::Results(&report));
        Ok(report)
    }

    pub async fn services(&self) -> Result<ServicesReport, CtmsError> {
        let envelope = self.request(PageRequest::get(SERVICES_PATH)).await?;
        let report = services::parse_services(&envelope.document);

        self.events
            .publish(EventKind::Services, Event::Services(&report));
        Ok(report)
    }

    /// The weekly schedule for the current week, or for the week containing `date`.
    pub async fn schedule(&self, date: Option<NaiveDate>) -> Result<WeeklySchedule, CtmsError> {
        let _flow = self.session.lock_flow(Feature::Schedule).await;

        let envelope = match date {
            None => self.fetch_schedule_page().await?,
            Some(date) => {
                let context = match self.session.restore(Feature::Schedule) {
                    Some(context) => context,
                    None => {
                        debug!("No schedule context yet, prefetching the schedule page");
                        self.fetch_schedule_page().await?.context
                    }
                };

                let week_start = date.format("%Y-%m-%d").to_string();
                let form = vec![
                    (WEEK_START_FIELD.to_owned(), week_start.clone()),
                    (SHOW_SCHEDULE_FIELD.to_owned(), SHOW_SCHEDULE_LABEL.to_owned()),
                ];
                let envelope = self
                    .request(PageRequest::post(SCHEDULE_PATH, form).with_context(context))
                    .await?;

                self.session.store_feature(Feature::Schedule, envelope.context.clone());
                self.session.set_schedule_date(Some(week_start));
                envelope
            }
        };

        let schedule = schedule::parse_schedule(&envelope.document);
        debug!(days = schedule.days.len(), week_start = ?schedule.week_start, "Parsed schedule");

        self.events
            .publish(EventKind::Schedule, Event::Schedule(&schedule));
        Ok(schedule)
    }

    async fn fetch_schedule_page(&self) -> Result<Envelope, CtmsError> {
        let envelope = self.request(PageRequest::get(SCHEDULE_PATH)).await?;
        self.session.store_feature(Feature::Schedule, envelope.context.clone());
        self.session
            .set_schedule_date(envelope.document.input_value(schedule::WEEK_START_INPUT));
        Ok(envelope)
    }

    /// Fetch a schedule note. Requires a prior [`CtmsApi::schedule`] call.
    pub async fn note(&self, id: u64) -> Result<Note, CtmsError> {
        let _flow = self.session.lock_flow(Feature::Schedule).await;

        let (Some(context), Some(week_start)) = (
            self.session.restore(Feature::Schedule),
            self.session.schedule_date(),
        ) else {
            return Err(CtmsError::precondition(
                "the schedule must be fetched before reading a note",
            ));
        };

        let form = vec![
            (CALLBACK_ID.to_owned(), NOTE_CALLBACK.to_owned()),
            (CALLBACK_PARAM.to_owned(), format!("get-note${id}")),
            (WEEK_START_FIELD.to_owned(), week_start),
        ];
        let envelope = self
            .request(PageRequest::post(SCHEDULE_PATH, form).with_context(context))
            .await?;

        let note = schedule::parse_note(id, &envelope.body)
            .ok_or_else(|| CtmsError::parse("schedule note", "response is not a framed callback reply"))?;

        self.events.publish(EventKind::Note, Event::Note(&note));
        Ok(note)
    }

    /// Exams matching `filter`, newest first.
    pub async fn exams(&self, filter: ExamFilter) -> Result<Vec<ExamRecord>, CtmsError> {
        let _flow = self.session.lock_flow(Feature::Exams).await;

        let context = match self.session.restore(Feature::Exams) {
            Some(context) => context,
            None => {
                debug!("No exams context yet, prefetching the exam page");
                let envelope = self.request(PageRequest::get(EXAMS_PATH)).await?;
                self.session.store_feature(Feature::Exams, envelope.context.clone());
                envelope.context
            }
        };

        let form = vec![
            (exams::FILTER_FIELD.to_owned(), filter.option().to_owned()),
            (exams::SHOW_BUTTON_FIELD.to_owned(), exams::SHOW_BUTTON_LABEL.to_owned()),
        ];
        let envelope = self
            .request(PageRequest::post(EXAMS_PATH, form).with_context(context))
            .await?;
        self.session.store_feature(Feature::Exams, envelope.context.clone());

        let list = exams::parse_exams(&envelope.document, Utc::now());
        debug!(filter = filter.option(), exams = list.len(), "Parsed exams");

        self.events.publish(EventKind::Exams, Event::Exams(&list));
        Ok(list)
    }

    /// Run a subscription command and return the refreshed class lists.
    pub async fn subscribe(
        &self,
        command: SubscriptionCommand,
    ) -> Result<SubscriptionPage, CtmsError> {
        let _flow = self.session.lock_flow(Feature::Subscription).await;

        let (context, student_id) = match (
            self.session.restore(Feature::Subscription),
            self.session.student_id(),
        ) {
            (Some(context), Some(student_id)) => (context, student_id),
            _ => self.bootstrap_subscription().await?,
        };

        let (callback_id, param) = command.callback(student_id);
        debug!(callback_id, param, "Sending subscription command");
        let form = vec![
            (CALLBACK_ID.to_owned(), callback_id.to_owned()),
            (CALLBACK_PARAM.to_owned(), param.clone()),
        ];
        let envelope = self
            .request(PageRequest::post(SUBSCRIPTION_PATH, form).with_context(context))
            .await?;

        subscription::check_callback_response(&param, &envelope.body)?;
        let page = subscription::parse_subscription(&envelope.document);

        self.events
            .publish(EventKind::Subscribe, Event::Subscription(&page));
        Ok(page)
    }

    async fn bootstrap_subscription(&self) -> Result<(PostbackContext, u64), CtmsError> {
        debug!("Bootstrapping subscription page");
        let envelope = self
            .request(PageRequest::get(SUBSCRIPTION_PATH).quiet())
            .await?;

        let student_id = subscription::parse_student_id(&envelope.body).ok_or_else(|| {
            CtmsError::precondition("student id not found on the subscription page")
        })?;
        info!(student_id, "Found student id for subscriptions");

        self.session
            .store_feature(Feature::Subscription, envelope.context.clone());
        self.session.set_student_id(student_id);
        Ok((envelope.context, student_id))
    }
}

/// Turn a transport failure into a client error, recognizing maintenance pages.
fn classify_failure(failure: TransportFailure, c2m: Duration) -> CtmsError {
    if let TransportFailure::Upstream {
        status: MAINTENANCE_STATUS,
        body: Some(body),
        ..
    } = &failure
    {
        let message = Document::parse(body)
            .select_first("h1")
            .map(markup::text);
        if let Some(message) = message {
            return CtmsError::Maintenance { message, c2m };
        }
    }

    CtmsError::Transport {
        source: failure,
        c2m,
    }
}
