use crate::cli::{Command, SubscribeAction};
use anyhow::Context;
use ctms::config::Config;
use ctms::ctms::models::subscription::SubscriptionCommand;
use ctms::ctms::stats::RequestStats;
use ctms::ctms::{CtmsApi, RelayTransport};
use ctms::data::kv::KvStore;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

/// Main application struct wiring configuration, persistence and the portal client.
pub struct App {
    api: CtmsApi,
    stats: Option<Arc<RequestStats>>,
}

#[derive(Serialize)]
struct StatusReport {
    logged_in: bool,
    online: Option<u32>,
    has_session: bool,
}

impl App {
    pub async fn new(config: &Config, with_stats: bool) -> Result<Self, anyhow::Error> {
        let relay = Url::parse(&config.relay_url)
            .with_context(|| format!("Invalid relay URL `{}`", config.relay_url))?;
        let portal = Url::parse(&config.portal_url)
            .with_context(|| format!("Invalid portal URL `{}`", config.portal_url))?;

        let store = KvStore::open(&config.store_path)
            .await
            .context("Failed to open session store")?;

        let transport = RelayTransport::new(
            relay,
            portal,
            config.request_timeout,
            Some(config.rate_limit_per_minute),
        )
        .context("Failed to create relay transport")?;

        let api = CtmsApi::new(Arc::new(transport), Arc::new(store)).await;
        let stats = with_stats.then(|| RequestStats::attach(api.events()));

        info!(
            relay = config.relay_url,
            portal = config.portal_url,
            timeout = ?config.request_timeout,
            rate_limit_per_minute = config.rate_limit_per_minute,
            "CTMS client ready"
        );

        Ok(Self { api, stats })
    }

    /// Run one command, printing its result as JSON on stdout.
    pub async fn run(&self, command: Command) -> ExitCode {
        let result = self.dispatch(command).await;

        if let Some(stats) = &self.stats {
            match serde_json::to_string(&stats.summary()) {
                Ok(summary) => eprintln!("{summary}"),
                Err(e) => error!(error = ?e, "Failed to serialize request stats"),
            }
        }

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = ?e, "Command failed");
                ExitCode::FAILURE
            }
        }
    }

    async fn dispatch(&self, command: Command) -> anyhow::Result<()> {
        let api = &self.api;
        match command {
            Command::Status => {
                let envelope = api.home().await?;
                print_json(&StatusReport {
                    logged_in: api.is_logged_in(),
                    online: envelope.online_count(),
                    has_session: api.session().token().is_some(),
                })
            }
            Command::Login { username, password } => {
                api.login(&username, &password).await?;
                if !api.is_logged_in() {
                    anyhow::bail!("CTMS still shows the login form after signing in");
                }
                print_json(&StatusReport {
                    logged_in: true,
                    online: None,
                    has_session: api.session().token().is_some(),
                })
            }
            Command::Logout => {
                // The logout callback needs tokens from a home page visit.
                api.home().await?;
                api.logout().await?;
                print_json(&serde_json::json!({ "logged_in": false }))
            }
            Command::Results => print_json(&api.results().await?),
            Command::Services => print_json(&api.services().await?),
            Command::Schedule { date } => print_json(&api.schedule(date).await?),
            Command::Note { id, date } => {
                api.schedule(date).await?;
                print_json(&api.note(id).await?)
            }
            Command::Exams { filter } => print_json(&api.exams(filter.into()).await?),
            Command::Subscribe { action } => {
                let command = match action.unwrap_or(SubscribeAction::List) {
                    SubscribeAction::List => SubscriptionCommand::List,
                    SubscribeAction::Add { class_id } => SubscriptionCommand::Subscribe(class_id),
                    SubscribeAction::Remove { class_id } => {
                        SubscriptionCommand::Unsubscribe(class_id)
                    }
                };
                print_json(&api.subscribe(command).await?)
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}
