//! Account bootstrap: turns a detected address into a rendered summary and a
//! scan-type prompt.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::backend::{AccountSummary, AddressValidation, ScanType};
use crate::chat::ChatSession;
use crate::error::ValidationError;
use crate::retry::retry_with_backoff;
use crate::session::{ActivityKind, BootstrapPhase};
use crate::timeline::{AccountDetails, Message, MessageContent, Role};

const NANO_PER_COIN: u64 = 1_000_000_000;

/// What triggered a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapSource {
    /// Typed or pasted by the user.
    Manual,
    /// Replayed from stored conversation history.
    History,
    /// Arrived with a deep link or navigation.
    Navigation,
}

impl BootstrapSource {
    pub fn is_automatic(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    PreviouslyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Summary shown and scan types offered.
    Completed,
    /// Summary failed; an error stub was shown and scan types offered.
    Failed,
    Skipped(SkipReason),
    /// Superseded or reset while running; nothing more was written.
    Abandoned,
    /// Not an address.
    Rejected,
}

fn search_key(address: &str) -> String {
    format!("search:{address}")
}

fn fetching_key(address: &str) -> String {
    format!("fetching:{address}")
}

fn details_key(address: &str) -> String {
    format!("details:{address}")
}

fn scan_types_key(address: &str) -> String {
    format!("scan-types:{address}")
}

/// Nano-units to whole coins, two decimals.
pub(crate) fn format_balance(nano: u64) -> String {
    let coins = Decimal::from(nano) / Decimal::from(NANO_PER_COIN);
    let rounded = coins.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{rounded:.2}")
}

/// Unix seconds as `Tue, 14 Nov 2023 22:13:20` (UTC, no zone suffix).
pub(crate) fn format_last_activity(unix_seconds: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0)
        .map(|at| at.format("%a, %d %b %Y %H:%M:%S").to_string())
}

pub(crate) fn details_from_summary(address: &str, summary: &AccountSummary) -> AccountDetails {
    AccountDetails {
        address: if summary.address.is_empty() {
            address.to_string()
        } else {
            summary.address.clone()
        },
        status: summary.status.clone(),
        is_wallet: summary.is_wallet,
        interfaces: summary.interfaces.clone(),
        last_activity: summary.last_activity.and_then(format_last_activity),
        balance: summary.balance.map(format_balance),
        is_scam: summary.is_scam,
        error: false,
    }
}

impl ChatSession {
    /// Bootstrap the conversation for `raw`.
    ///
    /// At most one attempt per (conversation, address) runs at a time.
    /// Automatic triggers for an address whose automatic attempt failed are
    /// ignored until a manual trigger for it.
    pub async fn handle_address_received(
        &self,
        raw: &str,
        source: BootstrapSource,
    ) -> BootstrapOutcome {
        let validation = self.inner.validator.validate_address(raw).await;
        self.bootstrap_validated(raw, validation, source).await
    }

    /// Bootstrap with an already computed validation of `raw`.
    pub(crate) async fn bootstrap_validated(
        &self,
        raw: &str,
        validation: AddressValidation,
        source: BootstrapSource,
    ) -> BootstrapOutcome {
        let inner = &self.inner;
        let address = match validation.normalized_address {
            Some(address) if validation.is_valid => address,
            _ => {
                let err = ValidationError::InvalidAddress {
                    input: raw.trim().to_string(),
                    reason: validation
                        .error
                        .unwrap_or_else(|| "unrecognized format".to_string()),
                };
                tracing::debug!("{}", err);
                inner.with_state(|s| {
                    s.timeline.upsert(
                        Message::agent(
                            "That doesn't look like a TON address. \
                             Paste a raw (0:...) or user-friendly address.",
                        )
                        .system(),
                    )
                });
                return BootstrapOutcome::Rejected;
            }
        };

        let session_id = inner.identity.ensure_id();
        let key = format!("{session_id}:{address}");

        // Idle -> Initializing
        let started = inner.with_state(|s| {
            if s.session.activity.is_active(ActivityKind::Bootstrap, &key) {
                return Err(SkipReason::InFlight);
            }
            if source.is_automatic() {
                if s.session.has_failed(&key) {
                    return Err(SkipReason::PreviouslyFailed);
                }
            } else {
                s.session.forget_failed(&key);
            }
            let token = s.session.activity.begin(ActivityKind::Bootstrap, key.clone());
            s.session.set_phase(&address, BootstrapPhase::Initializing);

            if s.session.address.as_deref() != Some(address.as_str()) {
                s.session.bound_job = None;
                s.session.pending_limit = None;
            }
            s.session.address = Some(address.clone());

            if s.timeline.find_by_dedupe_key(&search_key(&address)).is_none() {
                s.timeline.upsert(
                    Message::user(format!("Search {address}")).with_dedupe_key(search_key(&address)),
                );
            }
            s.timeline.upsert(
                Message::agent(format!("Fetching details for {address}..."))
                    .transient()
                    .with_dedupe_key(fetching_key(&address)),
            );
            s.session.set_phase(&address, BootstrapPhase::FetchingSummary);
            Ok(token)
        });
        let token = match started {
            Ok(token) => token,
            Err(reason) => {
                tracing::debug!(address = %address, ?reason, ?source, "Skipping bootstrap");
                return BootstrapOutcome::Skipped(reason);
            }
        };
        tracing::info!(address = %address, ?source, "Bootstrapping account");

        inner.persistence.init_session(
            &session_id,
            Some(format!("Analysis of {address}")),
            Some(address.clone()),
            None,
        );
        inner.persistence.append(
            &session_id,
            Role::User,
            format!("Search {address}"),
            format!("{session_id}:search:{address}"),
            None,
        );

        let backend = inner.backend.clone();
        let summary = retry_with_backoff(inner.settings.retry, "account_summary", |_| {
            let backend = backend.clone();
            let address = address.clone();
            async move { backend.get_account_summary(&address).await }
        })
        .await;

        // FetchingSummary -> Presenting
        let presented = inner.with_state(|s| {
            if !s.session.activity.is_current(&token) {
                return None;
            }
            s.timeline.remove_by_dedupe_key(&fetching_key(&address));
            match &summary {
                Ok(summary) => {
                    let details = details_from_summary(&address, summary);
                    let content = MessageContent::AccountDetails(details);
                    s.timeline.upsert(
                        Message::new(Role::Agent, content.clone())
                            .with_dedupe_key(details_key(&address)),
                    );
                    s.session.set_phase(&address, BootstrapPhase::Presenting);
                    Some(Some(content))
                }
                Err(_) => {
                    s.session.set_phase(&address, BootstrapPhase::Error);
                    let stub = AccountDetails {
                        address: address.clone(),
                        error: true,
                        ..Default::default()
                    };
                    s.timeline.upsert(
                        Message::new(Role::Agent, MessageContent::AccountDetails(stub))
                            .system()
                            .with_dedupe_key(details_key(&address)),
                    );
                    if source.is_automatic() {
                        s.session.remember_failed(&key);
                    }
                    s.session.set_phase(&address, BootstrapPhase::Presenting);
                    Some(None)
                }
            }
        });
        let Some(persistable) = presented else {
            tracing::debug!(address = %address, "Bootstrap superseded after summary");
            return BootstrapOutcome::Abandoned;
        };
        match (&summary, persistable) {
            (Ok(_), Some(content)) => inner.persistence.append(
                &session_id,
                Role::Agent,
                serde_json::to_string(&content).unwrap_or_default(),
                format!("{session_id}:details:{address}"),
                None,
            ),
            (Err(e), _) => {
                tracing::warn!(address = %address, kind = e.kind().as_str(), code = e.code(), "Account summary failed: {}", e)
            }
            _ => {}
        }

        tokio::time::sleep(inner.settings.settle_delay).await;

        // Presenting -> OfferingScanTypes
        let offered = inner.with_state(|s| {
            if !s.session.activity.finish(&token) {
                return false;
            }
            s.timeline.upsert(
                Message::new(
                    Role::Agent,
                    MessageContent::ScanTypePrompt {
                        address: address.clone(),
                        options: ScanType::ALL.to_vec(),
                    },
                )
                .system()
                .with_dedupe_key(scan_types_key(&address)),
            );
            s.session.set_phase(&address, BootstrapPhase::OfferingScanTypes);
            true
        });
        if !offered {
            return BootstrapOutcome::Abandoned;
        }

        if summary.is_ok() {
            BootstrapOutcome::Completed
        } else {
            BootstrapOutcome::Failed
        }
    }
}
