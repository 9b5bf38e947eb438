use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    outcome_label, CONFLICTS_TOTAL, DECISIONS_TOTAL, VISITS_SUBMITTED_TOTAL, WAL_COMPACTIONS_TOTAL,
};

use super::rules::{first_conflict, Attempt, RESCHEDULE_ORDER, SUBMIT_ORDER};
use super::validate::{
    parse_decision, parse_optional_schedule, parse_schedule, validate_id, validate_note, validate_phone,
};
use super::{visit_not_found, DayLedger, Engine, EngineError, WalCommand};

/// A client's booking request as it arrives, before validation.
#[derive(Debug, Clone, Default)]
pub struct SubmitVisit {
    pub property_id: PropertyId,
    pub client: UserId,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub phone: Option<String>,
}

fn record_conflict(err: &EngineError) {
    if let Some(rule) = err.conflict_rule() {
        metrics::counter!(CONFLICTS_TOTAL, "rule" => rule.label()).increment(1);
        tracing::debug!(rule = rule.label(), "booking refused: {err}");
    }
}

fn describe_schedule(schedule: Option<Schedule>) -> String {
    match schedule {
        Some(s) => format!("on {} at {}", s.date, s.time),
        None => "with no preferred date".to_string(),
    }
}

impl Engine {
    /// Admit a new visit request. Every rule check and the insert run under
    /// the day ledger's write lock; notifications go out after it is released.
    pub async fn submit(&self, req: SubmitVisit) -> Result<VisitRequest, EngineError> {
        let result = self.submit_locked(req).await;
        metrics::counter!(VISITS_SUBMITTED_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        let (visit, outbox) = result?;
        self.dispatcher.dispatch(outbox).await;
        Ok(visit)
    }

    async fn submit_locked(
        &self,
        req: SubmitVisit,
    ) -> Result<(VisitRequest, Vec<Outbound>), EngineError> {
        validate_id("property", &req.property_id)?;
        validate_id("user", &req.client)?;
        let phone = req.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        validate_phone(phone.as_deref())?;

        let today = self.clock.today();
        let schedule = parse_optional_schedule(
            req.preferred_date.as_deref(),
            req.preferred_time.as_deref(),
            today,
        )?;
        let property = self.live_property(&req.property_id).await?;
        let client = self.known_user(&req.client).await?;

        let visit = VisitRequest {
            id: Ulid::new(),
            property_id: property.id.clone(),
            user_id: client.id.clone(),
            requested_at: today,
            schedule,
            phone: phone.or_else(|| client.phone.clone()),
            status: VisitStatus::Pending,
            admin_id: None,
            admin_note: None,
            decided_at: None,
        };

        {
            let _gate = self.commit_gate.read().await;
            let ledger = self.store.ledger_or_create(visit.day_key());
            let mut guard = ledger.write().await;

            if let Some(s) = schedule {
                let snapshot = self.snapshot_of(&guard, s.date).await?;
                let attempt = Attempt {
                    client: &client.id,
                    property_id: &property.id,
                    vendor_id: &property.vendedor_id,
                    time: s.time,
                    exclude: None,
                };
                if let Some(conflict) = first_conflict(&SUBMIT_ORDER, &snapshot, &attempt) {
                    let err = EngineError::from(conflict);
                    record_conflict(&err);
                    return Err(err);
                }
            }

            let event = Event::VisitRequested {
                visit: visit.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }

        tracing::info!(
            visit = %visit.id,
            property = %visit.property_id,
            client = %visit.user_id,
            "visit requested {}",
            describe_schedule(visit.schedule)
        );
        let outbox = self.submission_outbox(&visit, &property, &client).await;
        Ok((visit, outbox))
    }

    /// Admins and the listing's vendor hear about the request; the first admin
    /// also gets a chat message from the client.
    async fn submission_outbox(
        &self,
        visit: &VisitRequest,
        property: &PropertyRecord,
        client: &UserRecord,
    ) -> Vec<Outbound> {
        let who = client.nome.as_deref().unwrap_or(&client.id);
        let when = describe_schedule(visit.schedule);
        let message = format!("{who} asked to visit property {} {when}", property.id);

        let admins = match self.directory.list_admins().await {
            Ok(admins) => admins,
            Err(e) => {
                tracing::warn!(visit = %visit.id, "admins not notified: {e}");
                Vec::new()
            }
        };

        let mut outbox: Vec<Outbound> = admins
            .iter()
            .map(|admin| {
                Outbound::Notify(Notification {
                    user_id: admin.id.clone(),
                    title: "New visit request".into(),
                    message: message.clone(),
                    kind: NotificationKind::VisitRequest,
                    link: Some("/visit-requests".into()),
                })
            })
            .collect();

        if property.vendedor_id != client.id {
            outbox.push(Outbound::Notify(Notification {
                user_id: property.vendedor_id.clone(),
                title: "New visit request for your property".into(),
                message: message.clone(),
                kind: NotificationKind::VisitRequest,
                link: Some("/vendor/visit-requests".into()),
            }));
        }

        if let Some(admin) = admins.first() {
            let mut text = format!("Hello, I would like to visit property {} {when}.", property.id);
            if let Some(phone) = &visit.phone {
                text.push_str(&format!(" Contact: {phone}."));
            }
            outbox.push(Outbound::Chat(ChatMessage {
                sender_id: client.id.clone(),
                receiver_id: admin.id.clone(),
                property_id: Some(property.id.clone()),
                text,
            }));
        }
        outbox
    }

    /// Approve, reject or conclude a request. Admins may decide any request,
    /// vendors only those on their own listings. The current status is not
    /// checked, so a decided request can be decided again.
    pub async fn decide(
        &self,
        id: Ulid,
        actor: &str,
        status: &str,
        note: Option<String>,
    ) -> Result<VisitRequest, EngineError> {
        let status = parse_decision(status)?;
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        validate_note(note.as_deref())?;
        let actor = self.known_user(actor).await?;

        let decided = {
            let _gate = self.commit_gate.read().await;
            let mut guard = self.lock_visit_day(id).await?;
            let visit = guard.get(id).cloned().ok_or_else(|| visit_not_found(id))?;
            self.authorize_decision(&actor, &visit).await?;

            let event = Event::VisitDecided {
                id,
                status,
                admin_id: actor.id.clone(),
                admin_note: note,
                decided_at: self.clock.today(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            guard.get(id).cloned().ok_or_else(|| visit_not_found(id))?
        };

        metrics::counter!(DECISIONS_TOTAL, "status" => status.as_str()).increment(1);
        tracing::info!(visit = %id, actor = %actor.id, "visit request {}", status.as_str());

        let mut message = format!(
            "Your visit to property {} {} was {}.",
            decided.property_id,
            describe_schedule(decided.schedule),
            status.as_str()
        );
        if let Some(note) = &decided.admin_note {
            message.push_str(&format!(" Note: {note}"));
        }
        let (title, kind) = match status {
            VisitStatus::Approved => ("Visit request approved", NotificationKind::VisitApproved),
            VisitStatus::Rejected => ("Visit request rejected", NotificationKind::VisitRejected),
            VisitStatus::Concluded => ("Visit concluded", NotificationKind::VisitConcluded),
            VisitStatus::Pending => ("Visit request updated", NotificationKind::Info),
        };
        self.dispatcher
            .dispatch(vec![Outbound::Notify(Notification {
                user_id: decided.user_id.clone(),
                title: title.into(),
                message,
                kind,
                link: Some("/my/visit-requests".into()),
            })])
            .await;
        Ok(decided)
    }

    async fn authorize_decision(&self, actor: &UserRecord, visit: &VisitRequest) -> Result<(), EngineError> {
        if actor.role == Role::Admin {
            return Ok(());
        }
        let owns = self
            .directory
            .get_property(&visit.property_id)
            .await?
            .is_some_and(|p| p.vendedor_id == actor.id);
        if actor.role == Role::Vendedor && owns {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "{} may not decide visit request {}",
                actor.id, visit.id
            )))
        }
    }

    /// Withdraw a pending request. The record is deleted, not kept as cancelled.
    pub async fn cancel(&self, id: Ulid, client: &str) -> Result<VisitRequest, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_visit_day(id).await?;
        let visit = owned_pending(&guard, id, client)?;
        self.persist_and_apply(&mut guard, &Event::VisitCancelled { id })
            .await?;
        tracing::info!(visit = %id, client, "visit request cancelled");
        Ok(visit)
    }

    /// Move a pending request to a new date and time. Only the property-slot
    /// rule is re-checked, ignoring the request itself.
    pub async fn reschedule(
        &self,
        id: Ulid,
        client: &str,
        date: &str,
        time: &str,
    ) -> Result<VisitRequest, EngineError> {
        let schedule = parse_schedule(date, time, self.clock.today())?;
        let result = self.reschedule_locked(id, client, schedule).await;
        if let Err(e) = &result {
            record_conflict(e);
        } else {
            tracing::info!(visit = %id, client, "visit rescheduled to {} {}", schedule.date, schedule.time);
        }
        result
    }

    async fn reschedule_locked(
        &self,
        id: Ulid,
        client: &str,
        schedule: Schedule,
    ) -> Result<VisitRequest, EngineError> {
        let _gate = self.commit_gate.read().await;
        let to_key = Some(schedule.date);
        loop {
            let from_key = self.store.day_of(&id).ok_or_else(|| visit_not_found(id))?;
            let from = self.store.ledger(&from_key).ok_or_else(|| visit_not_found(id))?;

            if from_key == to_key {
                let mut guard = from.write_owned().await;
                if !guard.contains(id) {
                    continue;
                }
                let visit = owned_pending(&guard, id, client)?;
                self.check_reschedule(&guard, &visit, schedule).await?;
                self.persist_and_apply(&mut guard, &Event::VisitRescheduled { id, schedule })
                    .await?;
                return guard.get(id).cloned().ok_or_else(|| visit_not_found(id));
            }

            // Two days: lock in key order so opposite moves cannot deadlock.
            let to = self.store.ledger_or_create(to_key);
            let (mut src, mut dst) = if from_key < to_key {
                let src = from.write_owned().await;
                (src, to.write_owned().await)
            } else {
                let dst = to.write_owned().await;
                (from.write_owned().await, dst)
            };
            if !src.contains(id) {
                continue;
            }
            let visit = owned_pending(&src, id, client)?;
            self.check_reschedule(&dst, &visit, schedule).await?;
            self.wal_append(&Event::VisitRescheduled { id, schedule }).await?;
            self.store.apply_move(&mut src, &mut dst, id, schedule);
            return dst.get(id).cloned().ok_or_else(|| visit_not_found(id));
        }
    }

    async fn check_reschedule(
        &self,
        target: &DayLedger,
        visit: &VisitRequest,
        schedule: Schedule,
    ) -> Result<(), EngineError> {
        let property = self.live_property(&visit.property_id).await?;
        let snapshot = self.snapshot_of(target, schedule.date).await?;
        let attempt = Attempt {
            client: &visit.user_id,
            property_id: &property.id,
            vendor_id: &property.vendedor_id,
            time: schedule.time,
            exclude: Some(visit.id),
        };
        match first_conflict(&RESCHEDULE_ORDER, &snapshot, &attempt) {
            Some(conflict) => Err(conflict.into()),
            None => Ok(()),
        }
    }

    /// Rewrite the WAL with one `VisitRequested` per live request, carrying its
    /// current schedule and decision, and forget days left with no request.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::with_capacity(self.store.visit_count());
        for ledger in self.store.ledgers() {
            let guard = ledger.read().await;
            events.extend(
                guard
                    .visits
                    .iter()
                    .map(|visit| Event::VisitRequested { visit: visit.clone() }),
            );
        }
        let kept = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let dropped = self.store.drop_empty_ledgers();
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = kept, dropped_days = dropped, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The request, if `client` owns it and it is still pending.
fn owned_pending(ledger: &DayLedger, id: Ulid, client: &str) -> Result<VisitRequest, EngineError> {
    let visit = ledger.get(id).ok_or_else(|| visit_not_found(id))?;
    if visit.user_id != client {
        return Err(EngineError::Forbidden(format!(
            "visit request {id} belongs to another user"
        )));
    }
    if visit.status != VisitStatus::Pending {
        return Err(EngineError::InvalidInput(format!(
            "visit request {id} is already {}",
            visit.status.as_str()
        )));
    }
    Ok(visit.clone())
}
