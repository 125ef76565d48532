//! Line-oriented commands read from stdin.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use serde_json::json;
use studyflow::db::status_repo;
use studyflow::{AppState, EntityId, EntityRecord, EntityStatus, UserId};

use crate::events::AgentEvent;
use crate::state::AgentState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(UserId),
    Logout,
    /// Creates a pending entity in the offline backend.
    Add(EntityId),
    Submit(EntityId),
    Retry(EntityId),
    Watch(EntityId),
    Unwatch(EntityId),
    Delete(EntityId),
    Status(Option<EntityId>),
    Stats,
    Foreground,
    Background,
    /// Moves an entity in the offline backend, as the worker would.
    Advance { id: EntityId, status: EntityStatus },
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login(_) => "login",
            Command::Logout => "logout",
            Command::Add(_) => "add",
            Command::Submit(_) => "submit",
            Command::Retry(_) => "retry",
            Command::Watch(_) => "watch",
            Command::Unwatch(_) => "unwatch",
            Command::Delete(_) => "delete",
            Command::Status(_) => "status",
            Command::Stats => "stats",
            Command::Foreground => "foreground",
            Command::Background => "background",
            Command::Advance { .. } => "advance",
            Command::Quit => "quit",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| "empty command".to_string())?;
        let mut arg = |what: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("{} requires <{}>", name, what))
        };

        let command = match name {
            "login" => Command::Login(UserId::new(arg("user")?)),
            "logout" => Command::Logout,
            "add" => Command::Add(EntityId::new(arg("id")?)),
            "submit" => Command::Submit(EntityId::new(arg("id")?)),
            "retry" => Command::Retry(EntityId::new(arg("id")?)),
            "watch" => Command::Watch(EntityId::new(arg("id")?)),
            "unwatch" => Command::Unwatch(EntityId::new(arg("id")?)),
            "delete" => Command::Delete(EntityId::new(arg("id")?)),
            "status" => Command::Status(arg("id").ok().map(EntityId::new)),
            "stats" => Command::Stats,
            "foreground" => Command::Foreground,
            "background" => Command::Background,
            "advance" => {
                let id = EntityId::new(arg("id")?);
                let status = arg("status")?
                    .parse::<EntityStatus>()
                    .map_err(|e| e.to_string())?;
                Command::Advance { id, status }
            }
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(command)
    }
}

pub async fn execute(state: &AgentState, command: Command) -> AgentEvent {
    let name = command.name();
    let tracker = &state.tracker;

    match command {
        Command::Login(user) => {
            tracker.session().sign_in(user);
            let resumed = tracker.resume_watching().await;
            AgentEvent::ok(name, Some(json!({ "resumed": resumed })))
        }
        Command::Logout => {
            tracker.shutdown();
            tracker.session().sign_out();
            AgentEvent::ok(name, None)
        }
        Command::Add(id) => {
            let Some(backend) = &state.offline else {
                return AgentEvent::err(name, "add is only available in offline mode");
            };
            let Some(user) = tracker.session().current_user() else {
                return AgentEvent::err(name, "not signed in");
            };
            backend.upsert(EntityRecord::new(id.clone(), user, EntityStatus::Pending, Utc::now()));
            AgentEvent::ok(name, Some(json!({ "entityId": id })))
        }
        Command::Submit(id) => match tracker.submit(&id).await {
            Ok(handle) => AgentEvent::ok(name, serde_json::to_value(handle).ok()),
            Err(e) => AgentEvent::err(name, e),
        },
        Command::Retry(id) => match tracker.retry(&id).await {
            Ok(handle) => AgentEvent::ok(name, serde_json::to_value(handle).ok()),
            Err(e) => AgentEvent::err(name, e),
        },
        Command::Watch(id) => match tracker.watch(&id).await {
            Ok(outcome) => AgentEvent::ok(name, Some(json!({ "outcome": format!("{:?}", outcome) }))),
            Err(e) => AgentEvent::err(name, e),
        },
        Command::Unwatch(id) => AgentEvent::ok(name, Some(json!({ "closed": tracker.unwatch(&id) }))),
        Command::Delete(id) => match tracker.delete(&id) {
            Some(_) => AgentEvent::ok(name, None),
            None => AgentEvent::err(name, format!("{} is not tracked", id)),
        },
        Command::Status(Some(id)) => match tracker.job_status(&id) {
            Some(status) => AgentEvent::ok(name, serde_json::to_value(status).ok()),
            None => AgentEvent::err(name, format!("{} is not tracked", id)),
        },
        Command::Status(None) => {
            let all: BTreeMap<String, _> = tracker
                .cache()
                .all()
                .into_iter()
                .map(|r| (r.id.to_string(), r.job_status()))
                .collect();
            AgentEvent::ok(name, serde_json::to_value(all).ok())
        }
        Command::Stats => stats(state, name),
        Command::Foreground => {
            state.set_app_state(AppState::Active);
            AgentEvent::ok(name, None)
        }
        Command::Background => {
            state.set_app_state(AppState::Background);
            AgentEvent::ok(name, None)
        }
        Command::Advance { id, status } => {
            let Some(backend) = &state.offline else {
                return AgentEvent::err(name, "advance is only available in offline mode");
            };
            match backend.set_status(&id, status) {
                Some(record) => AgentEvent::ok(name, serde_json::to_value(record).ok()),
                None => AgentEvent::err(name, format!("{} does not exist", id)),
            }
        }
        Command::Quit => AgentEvent::ok(name, None),
    }
}

/// Counts tracked entities by status, from the snapshot database when there
/// is one.
fn stats(state: &AgentState, name: &str) -> AgentEvent {
    let cache = state.tracker.cache();
    let counts: BTreeMap<String, u64> = match cache.database() {
        Some(db) => match status_repo::count_by_status(db) {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => return AgentEvent::err(name, e),
        },
        None => {
            let mut counts = BTreeMap::new();
            for record in cache.all() {
                *counts.entry(record.status.to_string()).or_insert(0) += 1;
            }
            counts
        }
    };
    AgentEvent::ok(name, Some(json!({ "total": cache.len(), "byStatus": counts })))
}
