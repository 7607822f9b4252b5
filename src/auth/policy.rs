use uuid::Uuid;

use crate::shared::enums::Role;

/// Minimal view of a ticket for access decisions.
#[derive(Debug, Clone, Copy)]
pub struct TicketRef {
    pub created_by: Uuid,
    pub assigned_to: Option<Uuid>,
}

#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    /// Unfiltered ticket listing.
    ViewAllTickets,
    ViewTicket(&'a TicketRef),
    /// helpful_notes / related_skills projection.
    ViewTriageFields,
    ReplyToTicket(&'a TicketRef),
    CloseTicket(&'a TicketRef),
    AssignTicket,
    ListUsers,
    UpdateUser,
}

/// Single authorization policy for every handler; role checks live nowhere else.
pub fn can_access(role: Role, actor: Uuid, action: Action) -> bool {
    match action {
        Action::ViewAllTickets => role == Role::Admin,
        Action::ViewTicket(ticket) => match role {
            Role::Admin => true,
            Role::Moderator => ticket.assigned_to == Some(actor) || ticket.created_by == actor,
            Role::User => ticket.created_by == actor,
        },
        Action::ViewTriageFields => role != Role::User,
        Action::ReplyToTicket(ticket) => {
            role == Role::Admin || ticket.created_by == actor || ticket.assigned_to == Some(actor)
        }
        Action::CloseTicket(ticket) => role == Role::Admin || ticket.assigned_to == Some(actor),
        Action::AssignTicket | Action::ListUsers | Action::UpdateUser => role == Role::Admin,
    }
}
