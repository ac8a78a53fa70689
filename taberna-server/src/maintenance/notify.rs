use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use futures::{StreamExt, stream};
use serde::Serialize;
use taberna_shared::domain::PushBatchResult;
use tinytemplate::TinyTemplate;
use tracing::{debug, info, warn};

use crate::maintenance::lifecycle::{due_for_open_notification, minute_floor, notification_window};
use crate::server::mail::{MailError, MailMessage, MailTransport};
use crate::server::push::PushSender;
use crate::server::{NotificationConfig, RecipientPolicy};
use crate::storage::models::{Mesa, Recipient};
use crate::storage::{StorageError, Store};

const BODY_TEMPLATE: &str = include_str!("../../templates/open_mesas.txt");

/// Mesas sharing one opening minute. Every recipient gets a single message
/// per group.
#[derive(Debug, Clone)]
pub struct OpeningGroup {
    pub minute: NaiveDateTime,
    pub mesas: Vec<Mesa>,
}

/// Partitions `mesas` by `opens_at` truncated to the minute, in minute
/// order. Mesas without an opening time are dropped.
pub fn group_by_opening_minute(mesas: Vec<Mesa>) -> Vec<OpeningGroup> {
    let mut groups: BTreeMap<NaiveDateTime, Vec<Mesa>> = BTreeMap::new();
    for mesa in mesas {
        let Some(opens_at) = mesa.opens_at else {
            continue;
        };
        let minute = minute_floor(opens_at);
        groups.entry(minute).or_default().push(mesa);
    }
    groups
        .into_iter()
        .map(|(minute, mesas)| OpeningGroup { minute, mesas })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub groups: usize,
    pub mesas: usize,
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
    /// Mesas stamped with `opens_notified_at` by this run.
    pub marked: usize,
    pub push: Option<PushBatchResult>,
}

impl DispatchReport {
    pub fn nothing_to_do(&self) -> bool {
        self.groups == 0
    }
}

#[derive(Serialize)]
struct MesaLine {
    title: String,
    opens_at: String,
    url: String,
}

#[derive(Serialize)]
struct BodyContext<'a> {
    name: &'a str,
    single: bool,
    count: usize,
    mesas: &'a [MesaLine],
}

pub struct OpenNotifier {
    store: Store,
    mailer: Arc<dyn MailTransport>,
    push: Option<PushSender>,
    cfg: NotificationConfig,
    app_url: String,
    tz: Tz,
}

impl OpenNotifier {
    pub fn new(
        store: Store,
        mailer: Arc<dyn MailTransport>,
        push: Option<PushSender>,
        cfg: NotificationConfig,
        app_url: impl Into<String>,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            mailer,
            push,
            cfg,
            app_url: app_url.into().trim_end_matches('/').to_string(),
            tz,
        }
    }

    /// Announces every mesa that opened in a finished minute of the
    /// tolerance window and was not announced yet. A minute still in
    /// progress waits for the next run. A group is marked notified once
    /// delivery was attempted for all its recipients, whatever the
    /// individual results.
    pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<DispatchReport, StorageError> {
        let stamp = now.naive_utc();
        let tolerance = Duration::seconds(self.cfg.tolerance_seconds);
        let (from, to) = notification_window(stamp, tolerance);
        let due: Vec<Mesa> = self
            .store
            .list_due_open_notifications(from, to)
            .await?
            .into_iter()
            .filter(|mesa| due_for_open_notification(mesa, stamp, tolerance))
            .collect();

        let mut report = DispatchReport::default();
        if due.is_empty() {
            debug!("notify: nothing to do");
            return Ok(report);
        }

        for group in group_by_opening_minute(due) {
            report.groups += 1;
            report.mesas += group.mesas.len();
            self.dispatch_group(&group, &mut report).await?;

            let ids: Vec<i32> = group.mesas.iter().map(|m| m.id).collect();
            let marked = self.store.mark_open_notified(&ids, stamp).await?;
            report.marked += marked;
            info!(
                minute = %group.minute,
                mesas = ids.len(),
                marked,
                "notify: group processed"
            );
        }

        if let Some(push) = self.push.as_ref().filter(|_| self.cfg.push_on_open) {
            match push.send_to_all(now).await {
                Ok(result) => report.push = Some(result),
                Err(err) => warn!(error = %err, "notify: push fan-out skipped"),
            }
        }

        info!(
            groups = report.groups,
            mesas = report.mesas,
            recipients = report.recipients,
            sent = report.sent,
            failed = report.failed,
            "notify: dispatch done"
        );
        Ok(report)
    }

    async fn dispatch_group(
        &self,
        group: &OpeningGroup,
        report: &mut DispatchReport,
    ) -> Result<(), StorageError> {
        let lines = self.mesa_lines(&group.mesas);
        let subject = self.subject(&group.mesas);
        let opted_in_only = self.cfg.recipients == RecipientPolicy::OptIn;
        let chunk = self.cfg.recipient_chunk_size.max(1);
        let mut after_id = 0;

        loop {
            let page = self
                .store
                .list_recipients(opted_in_only, after_id, chunk)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            let page_len = page.len();
            report.recipients += page_len;

            let lines = &lines;
            let subject = &subject;
            let mut sends = stream::iter(page)
                .map(|recipient| async move { self.send_one(recipient, subject, lines).await })
                .buffer_unordered(self.cfg.concurrency.max(1));
            while let Some(ok) = sends.next().await {
                if ok {
                    report.sent += 1;
                } else {
                    report.failed += 1;
                }
            }

            if (page_len as i64) < chunk {
                break;
            }
        }
        Ok(())
    }

    async fn send_one(&self, recipient: Recipient, subject: &str, lines: &[MesaLine]) -> bool {
        let text = match render_body(&recipient.name, lines) {
            Ok(text) => text,
            Err(err) => {
                warn!(user_id = recipient.id, error = %err, "notify: render failed");
                return false;
            }
        };
        let message = MailMessage {
            to: recipient.email,
            to_name: recipient.name,
            subject: subject.to_string(),
            text,
        };
        match self.mailer.send(message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(user_id = recipient.id, error = %err, "notify: send failed");
                false
            }
        }
    }

    fn mesa_lines(&self, mesas: &[Mesa]) -> Vec<MesaLine> {
        mesas
            .iter()
            .map(|mesa| MesaLine {
                title: mesa.title.clone(),
                opens_at: mesa
                    .opens_at
                    .map(|t| {
                        t.and_utc()
                            .with_timezone(&self.tz)
                            .format("%d/%m/%Y %H:%M")
                            .to_string()
                    })
                    .unwrap_or_default(),
                url: format!("{}/mesas/{}", self.app_url, mesa.id),
            })
            .collect()
    }

    fn subject(&self, mesas: &[Mesa]) -> String {
        match mesas {
            [only] => format!("Nueva mesa abierta: {}", only.title),
            _ => format!("{} mesas nuevas abiertas", mesas.len()),
        }
    }
}

fn render_body(name: &str, mesas: &[MesaLine]) -> Result<String, MailError> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template("open_mesas", BODY_TEMPLATE)
        .map_err(|e| MailError::Render(e.to_string()))?;
    let ctx = BodyContext {
        name,
        single: mesas.len() == 1,
        count: mesas.len(),
        mesas,
    };
    tt.render("open_mesas", &ctx)
        .map_err(|e| MailError::Render(e.to_string()))
}
