//! Terminal rendering for scheduling plans.
//!
//! Extension traits adding colored output to caldav-sched-core types using owo_colors.

use caldav_sched_core::ical::Rid;
use caldav_sched_core::{Method, PendingMessage, ReturnStatus, SchedulingPlan};
use owo_colors::OwoColorize;

pub trait Render {
    fn render(&self) -> String;
}

/// "master" for the whole series, otherwise the RECURRENCE-ID.
pub fn rid_label(rid: &Rid) -> String {
    match rid {
        Some(rid) => rid.to_string(),
        None => "master".to_string(),
    }
}

impl Render for Method {
    fn render(&self) -> String {
        match self {
            Method::Request => self.as_str().green().to_string(),
            Method::Cancel => self.as_str().red().to_string(),
            Method::Reply => self.as_str().cyan().to_string(),
        }
    }
}

impl Render for ReturnStatus {
    fn render(&self) -> String {
        match self {
            ReturnStatus::Ok => self.as_str().green().to_string(),
            _ => self.as_str().yellow().to_string(),
        }
    }
}

impl Render for PendingMessage {
    fn render(&self) -> String {
        let instances = match &self.rids {
            Some(rids) => rids.iter().map(rid_label).collect::<Vec<_>>().join(", "),
            None => "all instances".to_string(),
        };
        format!("{} → {} {}", self.method.render(), self.recipient, format!("({instances})").dimmed())
    }
}

impl Render for SchedulingPlan {
    fn render(&self) -> String {
        let mut lines = vec![
            format!("{} {}", "State:".bold(), self.state),
            format!("{} {}", "Action:".bold(), self.action),
            format!("{} {}", "Status:".bold(), self.status.render()),
        ];

        if self.messages.is_empty() {
            lines.push("No messages".dimmed().to_string());
        } else {
            lines.push(format!("{} (from {})", "Messages:".bold(), self.originator()));
            for message in &self.messages {
                lines.push(format!("   {}", message.render()));
            }
        }

        match &self.calendar {
            Some(calendar) => {
                lines.push("Store:".bold().to_string());
                lines.push(calendar.to_string().trim_end().to_string());
            }
            None => lines.push("Store: unchanged".dimmed().to_string()),
        }

        lines.join("\n")
    }
}
