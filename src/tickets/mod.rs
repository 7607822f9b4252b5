use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::policy::{can_access, Action, TicketRef};
use crate::auth::AuthUser;
use crate::shared::enums::{Priority, Role, TicketStatus};
use crate::shared::schema::{ticket_replies, tickets, users};
use crate::shared::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub helpful_notes: Option<String>,
    pub related_skills: Vec<String>,
    pub created_by: Uuid,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn access_ref(&self) -> TicketRef {
        TicketRef {
            created_by: self.created_by,
            assigned_to: self.assigned_to,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_replies)]
pub struct TicketReply {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub body: String,
    pub sent_by: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// Role-dependent projection: regular users never see the triage fields.
#[derive(Debug, Serialize)]
pub struct TicketView {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helpful_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_skills: Option<Vec<String>>,
    pub created_by: Uuid,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketView {
    pub fn project(ticket: Ticket, role: Role, actor: Uuid) -> Self {
        let include_triage = can_access(role, actor, Action::ViewTriageFields);
        Self {
            id: ticket.id,
            title: ticket.title,
            description: ticket.description,
            status: ticket.status,
            priority: ticket.priority,
            helpful_notes: if include_triage {
                ticket.helpful_notes
            } else {
                None
            },
            related_skills: if include_triage {
                Some(ticket.related_skills)
            } else {
                None
            },
            created_by: ticket.created_by,
            assigned_to: ticket.assigned_to,
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TicketDetail {
    pub ticket: TicketView,
    pub replies: Vec<TicketReply>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTicketResponse {
    pub message: String,
    pub ticket: TicketView,
}

#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    #[serde(rename = "replyText")]
    pub reply_text: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    #[serde(rename = "assignedTo")]
    pub assigned_to: Option<Uuid>,
    #[serde(rename = "assignedToEmail")]
    pub assigned_to_email: Option<String>,
}

fn load_ticket(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Ticket, (StatusCode, String)> {
    tickets::table
        .find(id)
        .first(conn)
        .optional()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
        .ok_or((StatusCode::NOT_FOUND, "Ticket not found".to_string()))
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<CreateTicketResponse>), (StatusCode, String)> {
    if req.title.is_empty() || req.description.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Title and description are required".to_string(),
        ));
    }

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let now = Utc::now();
    let ticket = Ticket {
        id: Uuid::new_v4(),
        title: req.title,
        description: req.description,
        status: TicketStatus::Created.as_str().to_string(),
        priority: Priority::Medium.as_str().to_string(),
        helpful_notes: None,
        related_skills: vec![],
        created_by: user.id,
        assigned_to: None,
        created_at: now,
        updated_at: now,
    };

    // The event row commits with the ticket, so triage delivery is
    // at-least-once even if the process dies right after this request.
    let event_id = conn
        .transaction(|conn| {
            diesel::insert_into(tickets::table)
                .values(&ticket)
                .execute(conn)?;
            crate::triage::enqueue_ticket_created(conn, &ticket)
        })
        .map_err(|e: diesel::result::Error| {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}"))
        })?;

    let _ = state.triage_tx.send(event_id);

    Ok((
        StatusCode::CREATED,
        Json(CreateTicketResponse {
            message: "Ticket created successfully, processing started".to_string(),
            ticket: TicketView::project(ticket, user.role, user.id),
        }),
    ))
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<TicketView>>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let mut query = tickets::table.into_boxed();
    if !can_access(user.role, user.id, Action::ViewAllTickets) {
        query = match user.role {
            Role::Moderator => query.filter(tickets::assigned_to.eq(Some(user.id))),
            _ => query.filter(tickets::created_by.eq(user.id)),
        };
    }

    let rows: Vec<Ticket> = query
        .order(tickets::created_at.desc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    Ok(Json(
        rows.into_iter()
            .map(|t| TicketView::project(t, user.role, user.id))
            .collect(),
    ))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<TicketDetail>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let ticket = load_ticket(&mut conn, id)?;
    // Invisible tickets are indistinguishable from absent ones.
    if !can_access(user.role, user.id, Action::ViewTicket(&ticket.access_ref())) {
        return Err((StatusCode::NOT_FOUND, "Ticket not found".to_string()));
    }

    let replies: Vec<TicketReply> = ticket_replies::table
        .filter(ticket_replies::ticket_id.eq(id))
        .order(ticket_replies::sent_at.asc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    Ok(Json(TicketDetail {
        ticket: TicketView::project(ticket, user.role, user.id),
        replies,
    }))
}

pub async fn reply_to_ticket(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplyRequest>,
) -> Result<(StatusCode, Json<TicketReply>), (StatusCode, String)> {
    if req.reply_text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Reply text is required".to_string()));
    }

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let ticket = load_ticket(&mut conn, id)?;
    if !can_access(user.role, user.id, Action::ReplyToTicket(&ticket.access_ref())) {
        return Err((
            StatusCode::FORBIDDEN,
            "You are not authorized to reply to this ticket".to_string(),
        ));
    }

    let now = Utc::now();
    let reply = TicketReply {
        id: Uuid::new_v4(),
        ticket_id: id,
        body: req.reply_text,
        sent_by: user.id,
        sent_at: now,
    };

    diesel::insert_into(ticket_replies::table)
        .values(&reply)
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;

    diesel::update(tickets::table.find(id))
        .set(tickets::updated_at.eq(now))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;

    Ok((StatusCode::CREATED, Json(reply)))
}

pub async fn close_ticket(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<TicketView>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let ticket = load_ticket(&mut conn, id)?;
    if !can_access(user.role, user.id, Action::CloseTicket(&ticket.access_ref())) {
        return Err((
            StatusCode::FORBIDDEN,
            "You are not authorized to close this ticket".to_string(),
        ));
    }
    if TicketStatus::parse(&ticket.status).is_some_and(|s| s.is_closed()) {
        return Err((StatusCode::CONFLICT, "Ticket is already closed".to_string()));
    }

    let now = Utc::now();
    diesel::update(tickets::table.find(id))
        .set((
            tickets::status.eq(TicketStatus::Closed.as_str()),
            tickets::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;

    let closed = load_ticket(&mut conn, id)?;
    Ok(Json(TicketView::project(closed, user.role, user.id)))
}

pub async fn assign_ticket(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<TicketView>, (StatusCode, String)> {
    if !can_access(user.role, user.id, Action::AssignTicket) {
        return Err((
            StatusCode::FORBIDDEN,
            "You are not authorized to assign tickets".to_string(),
        ));
    }

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    load_ticket(&mut conn, id)?;

    let target_id: Option<Uuid> = if let Some(user_id) = req.assigned_to {
        users::table
            .find(user_id)
            .select(users::id)
            .first(&mut conn)
            .optional()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
    } else if let Some(email) = req.assigned_to_email {
        users::table
            .filter(users::email.eq(&email))
            .select(users::id)
            .first(&mut conn)
            .optional()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
    } else {
        return Err((
            StatusCode::BAD_REQUEST,
            "assignedTo or assignedToEmail is required".to_string(),
        ));
    };

    let target_id =
        target_id.ok_or((StatusCode::NOT_FOUND, "User not found".to_string()))?;

    // Single targeted update; concurrent reassignments are last-writer-wins.
    diesel::update(tickets::table.find(id))
        .set((
            tickets::assigned_to.eq(Some(target_id)),
            tickets::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;

    let updated = load_ticket(&mut conn, id)?;
    Ok(Json(TicketView::project(updated, user.role, user.id)))
}

pub fn configure_ticket_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tickets", get(list_tickets).post(create_ticket))
        .route("/tickets/:id", get(get_ticket))
        .route("/tickets/:id/reply", post(reply_to_ticket))
        .route("/tickets/:id/close", put(close_ticket))
        .route("/tickets/:id/assign", put(assign_ticket))
}
