use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use caldav_sched_core::config::SchedulingConfig;
use caldav_sched_core::directory::StaticDirectory;
use caldav_sched_core::ical::{Calendar, parse_calendar};
use caldav_sched_core::services::{Directory, NoopTransport};
use caldav_sched_core::store::MemoryStore;
use caldav_sched_core::{
    ActionKind, Classification, ImplicitScheduler, LogItems, Method, ReturnStatus, SchedulingPlan,
    SchedulingServices, SchedulingState, StoredResource,
};
use clap::Args;
use serde::Serialize;
use tracing::debug;

use crate::render::{Render, rid_label};

/// Name the written resource is stored under in the owner's home.
const RESOURCE_NAME: &str = "resource.ics";
const ORGANIZER_COPY_NAME: &str = "organizer-copy.ics";

#[derive(Args)]
pub struct PlanArgs {
    /// UID of the principal owning the calendar home being written to
    #[arg(long)]
    owner: String,

    /// TOML file listing the known principals
    #[arg(long)]
    directory: PathBuf,

    /// Data currently stored in the resource
    #[arg(long)]
    old: Option<PathBuf>,

    /// Data being written
    #[arg(long, conflicts_with = "delete", required_unless_present = "delete")]
    new: Option<PathBuf>,

    /// Delete the stored resource instead of writing to it
    #[arg(long, requires = "old")]
    delete: bool,

    /// The organizer's own copy of the event, for attendee writes
    #[arg(long)]
    organizer_copy: Option<PathBuf>,

    /// Scheduling config (default: ~/.config/caldav-sched/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep attendee replies the organizer's client has not seen yet
    #[arg(long)]
    smart_merge: bool,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: PlanArgs) -> Result<()> {
    let directory = StaticDirectory::load(&args.directory)?;
    let config = SchedulingConfig::load(args.config.as_deref())?;
    let home = directory
        .principal_for_uid(&args.owner)
        .with_context(|| format!("Principal '{}' not found in {}", args.owner, args.directory.display()))?;

    let store = Arc::new(MemoryStore::new());

    if let Some(path) = &args.organizer_copy {
        let copy = read_calendar(path)?;
        let organizer = copy
            .organizer()
            .and_then(|address| directory.principal_for_address(&address))
            .context("Organizer copy has no ORGANIZER known to the directory")?;
        if organizer.uid != home.uid {
            store.put(&organizer.uid, ORGANIZER_COPY_NAME, copy)?;
        }
    }

    let resource = match &args.old {
        Some(path) => {
            let calendar = read_calendar(path)?;
            store.put(&home.uid, RESOURCE_NAME, calendar.clone())?;
            Some(StoredResource::new(RESOURCE_NAME, calendar))
        }
        None => None,
    };

    let services = SchedulingServices::new(Arc::new(directory), store, Arc::new(NoopTransport), config);
    let mut scheduler = ImplicitScheduler::new(services, home);

    let classification = if args.delete {
        let resource = resource.context("--delete needs the stored data in --old")?;
        scheduler.classify_delete(resource, false)?
    } else {
        let path = args.new.as_deref().context("Either --new or --delete is required")?;
        scheduler.classify_put(resource, read_calendar(path)?, false).await?
    };

    debug!(
        owner = %args.owner,
        scheduling = classification.scheduling,
        schedule_object = classification.schedule_object,
        state = %scheduler.state(),
        action = %scheduler.action(),
        "Classified write"
    );

    let plan = scheduler.plan(args.smart_merge).await?;
    debug!(status = plan.status.as_str(), messages = plan.messages.len(), "Planned scheduling");

    if args.json {
        let report = PlanReport::new(&classification, &plan);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", plan.render());
    }

    Ok(())
}

fn read_calendar(path: &Path) -> Result<Calendar> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_calendar(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[derive(Serialize)]
struct PlanReport<'a> {
    state: SchedulingState,
    action: ActionKind,
    status: ReturnStatus,
    classification: Classification,
    originator: &'a str,
    /// Data the resource would be stored with
    calendar: Option<String>,
    messages: Vec<MessageReport<'a>>,
    log_items: &'a LogItems,
}

#[derive(Serialize)]
struct MessageReport<'a> {
    method: Method,
    recipient: &'a str,
    /// Absent for whole-series messages
    instances: Option<Vec<String>>,
    ics: String,
}

impl<'a> PlanReport<'a> {
    fn new(classification: &Classification, plan: &'a SchedulingPlan) -> Self {
        PlanReport {
            state: plan.state,
            action: plan.action,
            status: plan.status,
            classification: *classification,
            originator: plan.originator(),
            calendar: plan.calendar.as_ref().map(Calendar::to_string),
            messages: plan
                .messages
                .iter()
                .map(|m| MessageReport {
                    method: m.method,
                    recipient: &m.recipient,
                    instances: m.rids.as_ref().map(|rids| rids.iter().map(rid_label).collect()),
                    ics: m.message.to_string(),
                })
                .collect(),
            log_items: &plan.log_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTORY: &str = r#"
[[principals]]
uid = "alice"
canonical_address = "urn:uuid:alice"
addresses = ["mailto:alice@example.com"]

[[principals]]
uid = "bob"
canonical_address = "urn:uuid:bob"
addresses = ["mailto:bob@example.com"]
"#;

    const MEETING: &str = "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//Test//Test//EN\nBEGIN:VEVENT\n\
UID:cli-1\nDTSTAMP:20250101T000000Z\nDTSTART:20250106T100000Z\n\
ORGANIZER:mailto:alice@example.com\nATTENDEE;PARTSTAT=ACCEPTED:mailto:alice@example.com\n\
ATTENDEE:mailto:bob@example.com\nEND:VEVENT\nEND:VCALENDAR\n";

    fn args(dir: &Path) -> PlanArgs {
        std::fs::write(dir.join("directory.toml"), DIRECTORY).unwrap();
        std::fs::write(dir.join("new.ics"), MEETING).unwrap();
        PlanArgs {
            owner: "alice".to_string(),
            directory: dir.join("directory.toml"),
            old: None,
            new: Some(dir.join("new.ics")),
            delete: false,
            organizer_copy: None,
            config: Some(dir.join("config.toml")),
            smart_merge: false,
            json: true,
        }
    }

    #[tokio::test]
    async fn test_plan_new_meeting() {
        let dir = tempfile::tempdir().unwrap();
        run(args(dir.path())).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_owner_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(dir.path());
        args.owner = "carol".to_string();

        let err = run(args).await.unwrap_err();
        assert!(err.to_string().contains("Principal 'carol' not found"));
    }

    #[tokio::test]
    async fn test_delete_needs_stored_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(dir.path());
        args.new = None;
        args.delete = true;

        let err = run(args).await.unwrap_err();
        assert!(err.to_string().contains("--delete needs the stored data"));
    }

    #[tokio::test]
    async fn test_report_lists_invitations() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path());
        let directory = StaticDirectory::load(&args.directory).unwrap();
        let home = directory.principal_for_uid("alice").unwrap();
        let services = SchedulingServices::new(
            Arc::new(directory),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopTransport),
            SchedulingConfig::default(),
        );
        let mut scheduler = ImplicitScheduler::new(services, home);
        let calendar = read_calendar(args.new.as_deref().unwrap()).unwrap();

        let classification = scheduler.classify_put(None, calendar, false).await.unwrap();
        let plan = scheduler.plan(false).await.unwrap();
        let report = PlanReport::new(&classification, &plan);

        assert_eq!(report.originator, "urn:uuid:alice");
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].recipient, "mailto:bob@example.com");
        assert!(report.classification.schedule_object);
    }
}
