//! Ticket-triage workflow: a short sequence of idempotent, checkpointed steps
//! driven off durable `ticket/created` events. Steps run strictly in order
//! within one execution; a cursor saved after each committed step lets a
//! retried execution resume from the first uncommitted step.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::email::Notifier;
use crate::llm::{skill_matcher, Classification, Classify};
use crate::shared::db::DbPool;
use crate::shared::enums::{Role, TicketStatus};
use crate::shared::schema::{tickets, triage_events, users};
use crate::shared::state::AppState;
use crate::tickets::Ticket;

pub const EVENT_TICKET_CREATED: &str = "ticket/created";

/// Whole-workflow retry budget after the first attempt.
const MAX_RETRIES: i32 = 2;
const POLL_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_PENDING: &str = "pending";
const EVENT_RUNNING: &str = "running";
const EVENT_DONE: &str = "done";
const EVENT_FAILED: &str = "failed";

const NOTIFY_SUBJECT: &str = "New Ticket Assigned";

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = triage_events)]
pub struct TriageEvent {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub name: String,
    pub title: String,
    pub description: String,
    pub created_by: Uuid,
    pub state: String,
    pub cursor: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert the triage event inside the ticket-creation transaction.
pub fn enqueue_ticket_created(
    conn: &mut PgConnection,
    ticket: &Ticket,
) -> QueryResult<Uuid> {
    let now = Utc::now();
    let event = TriageEvent {
        id: Uuid::new_v4(),
        ticket_id: ticket.id,
        name: EVENT_TICKET_CREATED.to_string(),
        title: ticket.title.clone(),
        description: ticket.description.clone(),
        created_by: ticket.created_by,
        state: EVENT_PENDING.to_string(),
        cursor: Step::FetchTicket.as_str().to_string(),
        attempts: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(triage_events::table)
        .values(&event)
        .execute(conn)?;
    Ok(event.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchTicket,
    MarkInProgress,
    PersistClassification,
    AssignModerator,
    Notify,
    Done,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchTicket => "fetch-ticket",
            Self::MarkInProgress => "mark-in-progress",
            Self::PersistClassification => "persist-classification",
            Self::AssignModerator => "assign-moderator",
            Self::Notify => "send-email-notification",
            Self::Done => "done",
        }
    }

    /// Unknown cursors restart from the beginning; every step is idempotent.
    pub fn parse(s: &str) -> Self {
        match s {
            "mark-in-progress" => Self::MarkInProgress,
            "persist-classification" => Self::PersistClassification,
            "assign-moderator" => Self::AssignModerator,
            "send-email-notification" => Self::Notify,
            "done" => Self::Done,
            _ => Self::FetchTicket,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone)]
pub struct Assignee {
    pub id: Uuid,
    pub email: String,
    pub skills: Vec<String>,
}

/// Persistence seam for the workflow. Every mutation is a targeted overwrite
/// keyed by ticket id, so re-running a step after a partial failure is safe.
pub trait TriageStore: Send + Sync {
    fn load_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError>;
    fn set_status(&self, id: Uuid, status: TicketStatus) -> Result<(), StoreError>;
    /// Writes priority/helpful_notes/related_skills and moves the ticket to
    /// IN_PROGRESS in one update.
    fn apply_classification(&self, id: Uuid, c: &Classification) -> Result<(), StoreError>;
    /// Moderators ordered by email ascending; that order is the documented
    /// deterministic tie-break for skill matches.
    fn moderators(&self) -> Result<Vec<Assignee>, StoreError>;
    fn first_admin(&self) -> Result<Option<Assignee>, StoreError>;
    fn user_email(&self, id: Uuid) -> Result<Option<String>, StoreError>;
    fn set_assignee(&self, id: Uuid, user: Option<Uuid>) -> Result<(), StoreError>;
    fn save_cursor(&self, event_id: Uuid, next: Step) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    /// The single non-retriable failure.
    #[error("ticket {0} not found")]
    TicketNotFound(Uuid),
    #[error("step {step} failed: {message}")]
    Step {
        step: &'static str,
        message: String,
    },
}

impl TriageError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::TicketNotFound(_))
    }
}

#[derive(Debug)]
pub struct TriageOutcome {
    pub success: bool,
    pub error: Option<TriageError>,
}

fn step_err(step: &'static str) -> impl Fn(StoreError) -> TriageError {
    move |e| TriageError::Step {
        step,
        message: e.to_string(),
    }
}

/// Run (or resume) the workflow for one event. Never panics and never lets an
/// error escape; the caller decides what to do with a failed outcome.
pub async fn run_triage(
    event: &TriageEvent,
    store: &dyn TriageStore,
    classifier: &dyn Classify,
    notifier: &dyn Notifier,
) -> TriageOutcome {
    match run_steps(event, store, classifier, notifier).await {
        Ok(()) => {
            info!("triage completed for ticket {}", event.ticket_id);
            TriageOutcome {
                success: true,
                error: None,
            }
        }
        Err(e) => {
            error!("triage for ticket {} failed: {e}", event.ticket_id);
            TriageOutcome {
                success: false,
                error: Some(e),
            }
        }
    }
}

async fn run_steps(
    event: &TriageEvent,
    store: &dyn TriageStore,
    classifier: &dyn Classify,
    notifier: &dyn Notifier,
) -> Result<(), TriageError> {
    let mut step = Step::parse(&event.cursor);
    loop {
        match step {
            Step::FetchTicket => {
                let ticket = store
                    .load_ticket(event.ticket_id)
                    .map_err(step_err(Step::FetchTicket.as_str()))?;
                if ticket.is_none() {
                    return Err(TriageError::TicketNotFound(event.ticket_id));
                }
                advance(store, event.id, &mut step, Step::MarkInProgress)?;
            }
            Step::MarkInProgress => {
                store
                    .set_status(event.ticket_id, TicketStatus::Todo)
                    .map_err(step_err(Step::MarkInProgress.as_str()))?;
                advance(store, event.id, &mut step, Step::PersistClassification)?;
            }
            Step::PersistClassification => {
                // The AI call is not a checkpoint boundary; a resumed run
                // re-invokes it. All provider failures surface as None.
                let classification = classifier.classify(&event.title, &event.description).await;
                if let Some(c) = &classification {
                    store
                        .apply_classification(event.ticket_id, c)
                        .map_err(step_err(Step::PersistClassification.as_str()))?;
                }
                advance(store, event.id, &mut step, Step::AssignModerator)?;
            }
            Step::AssignModerator => {
                let ticket = store
                    .load_ticket(event.ticket_id)
                    .map_err(step_err(Step::AssignModerator.as_str()))?
                    .ok_or(TriageError::TicketNotFound(event.ticket_id))?;
                let assignee = pick_assignee(store, &ticket.related_skills)
                    .map_err(step_err(Step::AssignModerator.as_str()))?;
                store
                    .set_assignee(event.ticket_id, assignee.as_ref().map(|a| a.id))
                    .map_err(step_err(Step::AssignModerator.as_str()))?;
                advance(store, event.id, &mut step, Step::Notify)?;
            }
            Step::Notify => {
                let ticket = store
                    .load_ticket(event.ticket_id)
                    .map_err(step_err(Step::Notify.as_str()))?
                    .ok_or(TriageError::TicketNotFound(event.ticket_id))?;
                if let Some(assignee_id) = ticket.assigned_to {
                    match store
                        .user_email(assignee_id)
                        .map_err(step_err(Step::Notify.as_str()))?
                    {
                        Some(email) => notifier
                            .send(
                                &email,
                                NOTIFY_SUBJECT,
                                &format!(
                                    "A new ticket has been assigned to you. {}",
                                    ticket.title
                                ),
                            )
                            .map_err(|e| TriageError::Step {
                                step: Step::Notify.as_str(),
                                message: e.to_string(),
                            })?,
                        None => {
                            warn!("assignee {assignee_id} vanished before notification")
                        }
                    }
                }
                advance(store, event.id, &mut step, Step::Done)?;
            }
            Step::Done => return Ok(()),
        }
    }
}

fn advance(
    store: &dyn TriageStore,
    event_id: Uuid,
    step: &mut Step,
    next: Step,
) -> Result<(), TriageError> {
    store.save_cursor(event_id, next).map_err(|e| TriageError::Step {
        step: step.as_str(),
        message: format!("checkpoint: {e}"),
    })?;
    *step = next;
    Ok(())
}

/// First moderator (email order) with any case-insensitive substring skill
/// match; empty skill lists skip straight to the admin fallback.
fn pick_assignee(
    store: &dyn TriageStore,
    related_skills: &[String],
) -> Result<Option<Assignee>, StoreError> {
    if let Some(matcher) = skill_matcher(related_skills) {
        for moderator in store.moderators()? {
            if moderator.skills.iter().any(|s| matcher.is_match(s)) {
                return Ok(Some(moderator));
            }
        }
    }
    store.first_admin()
}

pub struct PgTriageStore {
    pool: DbPool,
}

impl PgTriageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>,
        StoreError,
    > {
        self.pool.get().map_err(|e| StoreError(e.to_string()))
    }
}

impl TriageStore for PgTriageStore {
    fn load_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        tickets::table
            .find(id)
            .first(&mut conn)
            .optional()
            .map_err(|e| StoreError(e.to_string()))
    }

    fn set_status(&self, id: Uuid, status: TicketStatus) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(tickets::table.find(id))
            .set((
                tickets::status.eq(status.as_str()),
                tickets::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    fn apply_classification(&self, id: Uuid, c: &Classification) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(tickets::table.find(id))
            .set((
                tickets::priority.eq(c.priority.as_str()),
                tickets::helpful_notes.eq(Some(c.helpful_notes.clone())),
                tickets::related_skills.eq(c.related_skills.clone()),
                tickets::status.eq(TicketStatus::InProgress.as_str()),
                tickets::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    fn moderators(&self) -> Result<Vec<Assignee>, StoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<(Uuid, String, Vec<String>)> = users::table
            .filter(users::role.eq(Role::Moderator.as_str()))
            .order(users::email.asc())
            .select((users::id, users::email, users::skills))
            .load(&mut conn)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|(id, email, skills)| Assignee { id, email, skills })
            .collect())
    }

    fn first_admin(&self) -> Result<Option<Assignee>, StoreError> {
        let mut conn = self.conn()?;
        let row: Option<(Uuid, String, Vec<String>)> = users::table
            .filter(users::role.eq(Role::Admin.as_str()))
            .order(users::email.asc())
            .select((users::id, users::email, users::skills))
            .first(&mut conn)
            .optional()
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(row.map(|(id, email, skills)| Assignee { id, email, skills }))
    }

    fn user_email(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        users::table
            .find(id)
            .select(users::email)
            .first(&mut conn)
            .optional()
            .map_err(|e| StoreError(e.to_string()))
    }

    fn set_assignee(&self, id: Uuid, user: Option<Uuid>) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(tickets::table.find(id))
            .set((
                tickets::assigned_to.eq(user),
                tickets::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    fn save_cursor(&self, event_id: Uuid, next: Step) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(triage_events::table.find(event_id))
            .set((
                triage_events::cursor.eq(next.as_str()),
                triage_events::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}

/// Background worker: wakes on a nudge or the poll tick, claims pending
/// events oldest-first and runs them to a terminal state. Executions for
/// different tickets are independent of one another.
pub fn spawn_worker(
    state: Arc<AppState>,
    rx: mpsc::UnboundedReceiver<Uuid>,
) -> JoinHandle<()> {
    tokio::spawn(worker_loop(state, rx))
}

async fn worker_loop(state: Arc<AppState>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
    let store = PgTriageStore::new(state.conn.clone());
    info!("triage worker started");
    loop {
        match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
            Ok(None) => break, // all senders dropped; shutting down
            Ok(Some(_)) | Err(_) => {}
        }
        loop {
            let event = match claim_next(&state.conn) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to claim triage event: {e}");
                    break;
                }
            };
            process_event(&state, &store, event).await;
        }
    }
}

fn claim_next(pool: &DbPool) -> Result<Option<TriageEvent>, StoreError> {
    let mut conn = pool.get().map_err(|e| StoreError(e.to_string()))?;
    conn.transaction(|conn| {
        let event: Option<TriageEvent> = triage_events::table
            .filter(triage_events::state.eq(EVENT_PENDING))
            .order(triage_events::created_at.asc())
            .first(conn)
            .optional()?;
        if let Some(event) = &event {
            diesel::update(triage_events::table.find(event.id))
                .set((
                    triage_events::state.eq(EVENT_RUNNING),
                    triage_events::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
        }
        Ok(event)
    })
    .map_err(|e: diesel::result::Error| StoreError(e.to_string()))
}

/// What happens to an event after an execution finishes.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Done,
    Fail(String),
    Retry { attempts: i32, last_error: String },
}

/// Non-retriable errors fail immediately without consuming the retry
/// budget; retriable ones requeue until `attempts` reaches `MAX_RETRIES`.
fn dispose_outcome(error: Option<&TriageError>, attempts: i32) -> Disposition {
    match error {
        None => Disposition::Done,
        Some(err) if !err.is_retriable() => Disposition::Fail(err.to_string()),
        Some(err) if attempts >= MAX_RETRIES => Disposition::Fail(err.to_string()),
        Some(err) => Disposition::Retry {
            attempts: attempts + 1,
            last_error: err.to_string(),
        },
    }
}

async fn process_event(state: &Arc<AppState>, store: &PgTriageStore, event: TriageEvent) {
    let outcome = run_triage(
        &event,
        store,
        state.classifier.as_ref(),
        state.notifier.as_ref(),
    )
    .await;

    let result = match dispose_outcome(outcome.error.as_ref(), event.attempts) {
        Disposition::Done => finish_event(&state.conn, event.id, EVENT_DONE, None),
        Disposition::Fail(message) => {
            warn!(
                "triage for ticket {} failed permanently after {} attempts: {message}",
                event.ticket_id,
                event.attempts + 1
            );
            finish_event(&state.conn, event.id, EVENT_FAILED, Some(message))
        }
        Disposition::Retry {
            attempts,
            last_error,
        } => requeue_event(&state.conn, event.id, attempts, &last_error),
    };

    if let Err(e) = result {
        error!("failed to record outcome for event {}: {e}", event.id);
    }
}

fn finish_event(
    pool: &DbPool,
    event_id: Uuid,
    state: &str,
    last_error: Option<String>,
) -> Result<(), StoreError> {
    let mut conn = pool.get().map_err(|e| StoreError(e.to_string()))?;
    diesel::update(triage_events::table.find(event_id))
        .set((
            triage_events::state.eq(state),
            triage_events::last_error.eq(last_error),
            triage_events::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .map_err(|e| StoreError(e.to_string()))?;
    Ok(())
}

fn requeue_event(
    pool: &DbPool,
    event_id: Uuid,
    attempts: i32,
    last_error: &str,
) -> Result<(), StoreError> {
    let mut conn = pool.get().map_err(|e| StoreError(e.to_string()))?;
    diesel::update(triage_events::table.find(event_id))
        .set((
            triage_events::state.eq(EVENT_PENDING),
            triage_events::attempts.eq(attempts),
            triage_events::last_error.eq(Some(last_error.to_string())),
            triage_events::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .map_err(|e| StoreError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::MailError;
    use crate::shared::enums::Priority;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        tickets: Mutex<HashMap<Uuid, Ticket>>,
        users: Mutex<Vec<Assignee>>,
        admins: Mutex<Vec<Assignee>>,
        cursors: Mutex<Vec<Step>>,
        fail_set_status: Mutex<bool>,
    }

    impl FakeStore {
        fn with_ticket(ticket: Ticket) -> Self {
            let store = Self::default();
            store.tickets.lock().unwrap().insert(ticket.id, ticket);
            store
        }

        fn add_moderator(&self, email: &str, skills: &[&str]) -> Uuid {
            let id = Uuid::new_v4();
            let mut users = self.users.lock().unwrap();
            users.push(Assignee {
                id,
                email: email.to_string(),
                skills: skills.iter().map(|s| s.to_string()).collect(),
            });
            users.sort_by(|a, b| a.email.cmp(&b.email));
            id
        }

        fn add_admin(&self, email: &str) -> Uuid {
            let id = Uuid::new_v4();
            let mut admins = self.admins.lock().unwrap();
            admins.push(Assignee {
                id,
                email: email.to_string(),
                skills: vec![],
            });
            admins.sort_by(|a, b| a.email.cmp(&b.email));
            id
        }

        fn ticket(&self, id: Uuid) -> Ticket {
            self.tickets.lock().unwrap().get(&id).cloned().unwrap()
        }
    }

    impl TriageStore for FakeStore {
        fn load_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
            Ok(self.tickets.lock().unwrap().get(&id).cloned())
        }

        fn set_status(&self, id: Uuid, status: TicketStatus) -> Result<(), StoreError> {
            if *self.fail_set_status.lock().unwrap() {
                return Err(StoreError("simulated outage".to_string()));
            }
            if let Some(t) = self.tickets.lock().unwrap().get_mut(&id) {
                t.status = status.as_str().to_string();
            }
            Ok(())
        }

        fn apply_classification(&self, id: Uuid, c: &Classification) -> Result<(), StoreError> {
            if let Some(t) = self.tickets.lock().unwrap().get_mut(&id) {
                t.priority = c.priority.as_str().to_string();
                t.helpful_notes = Some(c.helpful_notes.clone());
                t.related_skills = c.related_skills.clone();
                t.status = TicketStatus::InProgress.as_str().to_string();
            }
            Ok(())
        }

        fn moderators(&self) -> Result<Vec<Assignee>, StoreError> {
            Ok(self.users.lock().unwrap().clone())
        }

        fn first_admin(&self) -> Result<Option<Assignee>, StoreError> {
            Ok(self.admins.lock().unwrap().first().cloned())
        }

        fn user_email(&self, id: Uuid) -> Result<Option<String>, StoreError> {
            let users = self.users.lock().unwrap();
            let admins = self.admins.lock().unwrap();
            Ok(users
                .iter()
                .chain(admins.iter())
                .find(|a| a.id == id)
                .map(|a| a.email.clone()))
        }

        fn set_assignee(&self, id: Uuid, user: Option<Uuid>) -> Result<(), StoreError> {
            if let Some(t) = self.tickets.lock().unwrap().get_mut(&id) {
                t.assigned_to = user;
            }
            Ok(())
        }

        fn save_cursor(&self, _event_id: Uuid, next: Step) -> Result<(), StoreError> {
            self.cursors.lock().unwrap().push(next);
            Ok(())
        }
    }

    struct FakeClassifier(Option<Classification>);

    #[async_trait]
    impl Classify for FakeClassifier {
        async fn classify(&self, _title: &str, _description: &str) -> Option<Classification> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn new_ticket(title: &str, description: &str) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: description.to_string(),
            status: TicketStatus::Created.as_str().to_string(),
            priority: Priority::Medium.as_str().to_string(),
            helpful_notes: None,
            related_skills: vec![],
            created_by: Uuid::new_v4(),
            assigned_to: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn event_for(ticket: &Ticket) -> TriageEvent {
        let now = Utc::now();
        TriageEvent {
            id: Uuid::new_v4(),
            ticket_id: ticket.id,
            name: EVENT_TICKET_CREATED.to_string(),
            title: ticket.title.clone(),
            description: ticket.description.clone(),
            created_by: ticket.created_by,
            state: EVENT_PENDING.to_string(),
            cursor: Step::FetchTicket.as_str().to_string(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn classification(priority: Priority, skills: &[&str]) -> Classification {
        Classification {
            summary: "summary".to_string(),
            priority,
            helpful_notes: "notes".to_string(),
            related_skills: skills.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn happy_path_assigns_matching_moderator_and_notifies() {
        let ticket = new_ticket("Cannot login", "500 on /auth/login");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        let moderator = store.add_moderator("mod@example.com", &["Node.js"]);
        store.add_admin("admin@example.com");
        let classifier = FakeClassifier(Some(classification(Priority::High, &["Node.js"])));
        let notifier = RecordingNotifier::default();

        let event = event_for(&store.ticket(ticket_id));
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;

        assert!(outcome.success);
        let final_ticket = store.ticket(ticket_id);
        assert_eq!(final_ticket.status, "IN_PROGRESS");
        assert_eq!(final_ticket.priority, "high");
        assert_eq!(final_ticket.assigned_to, Some(moderator));
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "mod@example.com");
        assert_eq!(sent[0].1, NOTIFY_SUBJECT);
        assert!(sent[0].2.contains("Cannot login"));
    }

    #[tokio::test]
    async fn null_classification_leaves_todo_and_falls_back_to_admin() {
        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        store.add_moderator("mod@example.com", &["Node.js"]);
        let admin = store.add_admin("admin@example.com");
        let classifier = FakeClassifier(None);
        let notifier = RecordingNotifier::default();

        let event = event_for(&store.ticket(ticket_id));
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;

        assert!(outcome.success);
        let final_ticket = store.ticket(ticket_id);
        assert_eq!(final_ticket.status, "TODO");
        assert_eq!(final_ticket.priority, "medium");
        // Empty skill list never matches a moderator.
        assert_eq!(final_ticket.assigned_to, Some(admin));
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_moderator_match_and_no_admin_leaves_unassigned_and_silent() {
        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        store.add_moderator("mod@example.com", &["Python"]);
        let classifier = FakeClassifier(Some(classification(Priority::Low, &["Rust"])));
        let notifier = RecordingNotifier::default();

        let event = event_for(&store.ticket(ticket_id));
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;

        assert!(outcome.success);
        assert_eq!(store.ticket(ticket_id).assigned_to, None);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tie_break_picks_lowest_email() {
        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        store.add_moderator("zoe@example.com", &["Rust"]);
        let first = store.add_moderator("amy@example.com", &["Rust"]);
        let classifier = FakeClassifier(Some(classification(Priority::Medium, &["Rust"])));
        let notifier = RecordingNotifier::default();

        let event = event_for(&store.ticket(ticket_id));
        run_triage(&event, &store, &classifier, &notifier).await;

        assert_eq!(store.ticket(ticket_id).assigned_to, Some(first));
    }

    #[tokio::test]
    async fn missing_ticket_is_non_retriable() {
        let store = FakeStore::default();
        let classifier = FakeClassifier(None);
        let notifier = RecordingNotifier::default();
        let ghost = new_ticket("gone", "gone");

        let event = event_for(&ghost);
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;

        assert!(!outcome.success);
        let err = outcome.error.unwrap();
        assert!(!err.is_retriable());
        assert!(matches!(err, TriageError::TicketNotFound(_)));
    }

    #[tokio::test]
    async fn store_failure_is_retriable_and_resume_skips_committed_steps() {
        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        store.add_admin("admin@example.com");
        *store.fail_set_status.lock().unwrap() = true;
        let classifier = FakeClassifier(None);
        let notifier = RecordingNotifier::default();

        let mut event = event_for(&store.ticket(ticket_id));
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().is_retriable());

        // fetch-ticket committed, so the saved cursor points at mark-in-progress.
        let resume_from = *store.cursors.lock().unwrap().last().unwrap();
        assert_eq!(resume_from, Step::MarkInProgress);

        *store.fail_set_status.lock().unwrap() = false;
        event.cursor = resume_from.as_str().to_string();
        let outcome = run_triage(&event, &store, &classifier, &notifier).await;
        assert!(outcome.success);
        assert_eq!(store.ticket(ticket_id).status, "TODO");
    }

    #[tokio::test]
    async fn replaying_early_steps_is_idempotent() {
        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        let moderator = store.add_moderator("mod@example.com", &["Rust"]);
        let classifier = FakeClassifier(Some(classification(Priority::High, &["Rust"])));
        let notifier = RecordingNotifier::default();

        let event = event_for(&store.ticket(ticket_id));
        run_triage(&event, &store, &classifier, &notifier).await;
        let once = store.ticket(ticket_id);

        // Replay from the top, as a whole-workflow retry would after a lost cursor.
        run_triage(&event, &store, &classifier, &notifier).await;
        let twice = store.ticket(ticket_id);

        assert_eq!(once.status, twice.status);
        assert_eq!(once.priority, twice.priority);
        assert_eq!(once.helpful_notes, twice.helpful_notes);
        assert_eq!(once.related_skills, twice.related_skills);
        assert_eq!(twice.assigned_to, Some(moderator));
    }

    #[tokio::test]
    async fn notifier_failure_is_a_retriable_step_failure() {
        struct FailingNotifier;
        impl Notifier for FailingNotifier {
            fn send(&self, _: &str, _: &str, _: &str) -> Result<(), MailError> {
                Err(MailError::Smtp("connection refused".to_string()))
            }
        }

        let ticket = new_ticket("t", "d");
        let ticket_id = ticket.id;
        let store = FakeStore::with_ticket(ticket);
        store.add_moderator("mod@example.com", &["Rust"]);
        let classifier = FakeClassifier(Some(classification(Priority::High, &["Rust"])));

        let event = event_for(&store.ticket(ticket_id));
        let outcome = run_triage(&event, &store, &classifier, &FailingNotifier).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().is_retriable());
        // Assignment committed before the notify failure and stays in place.
        assert!(store.ticket(ticket_id).assigned_to.is_some());
    }

    #[test]
    fn unknown_cursor_restarts_from_fetch() {
        assert_eq!(Step::parse("???"), Step::FetchTicket);
        assert_eq!(Step::parse("assign-moderator"), Step::AssignModerator);
        assert_eq!(Step::parse("done"), Step::Done);
    }

    fn step_failure(message: &str) -> TriageError {
        TriageError::Step {
            step: "update-ticket-status",
            message: message.to_string(),
        }
    }

    #[test]
    fn clean_execution_marks_the_event_done() {
        assert_eq!(dispose_outcome(None, 0), Disposition::Done);
        assert_eq!(dispose_outcome(None, MAX_RETRIES), Disposition::Done);
    }

    #[test]
    fn missing_ticket_fails_without_consuming_retries() {
        let err = TriageError::TicketNotFound(Uuid::new_v4());
        assert!(matches!(
            dispose_outcome(Some(&err), 0),
            Disposition::Fail(_)
        ));
    }

    #[test]
    fn retriable_failures_requeue_until_the_budget_runs_out() {
        let err = step_failure("connection reset");
        assert_eq!(
            dispose_outcome(Some(&err), 0),
            Disposition::Retry {
                attempts: 1,
                last_error: err.to_string(),
            }
        );
        assert_eq!(
            dispose_outcome(Some(&err), MAX_RETRIES - 1),
            Disposition::Retry {
                attempts: MAX_RETRIES,
                last_error: err.to_string(),
            }
        );
        assert!(matches!(
            dispose_outcome(Some(&err), MAX_RETRIES),
            Disposition::Fail(_)
        ));
    }
}
