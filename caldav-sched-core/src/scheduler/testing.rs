//! Fixtures shared by the scheduler tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::address::Hosting;
use crate::config::SchedulingConfig;
use crate::directory::StaticDirectory;
use crate::ical::{Calendar, parse_calendar};
use crate::scheduler::{ImplicitScheduler, StoredResource, Transaction};
use crate::services::{DeliveryOptions, DeliveryReport, Directory, Principal, SchedulingServices, Transport};
use crate::store::MemoryStore;

fn local(uid: &str, mailto: &str) -> Principal {
    Principal {
        uid: uid.to_string(),
        canonical_address: format!("urn:uuid:{uid}"),
        addresses: vec![mailto.to_string()],
        enabled_as_organizer: true,
        hosting: Hosting::Local,
    }
}

pub(crate) fn directory() -> StaticDirectory {
    let mut intern = local("intern", "mailto:intern@example.com");
    intern.enabled_as_organizer = false;
    let mut pat = local("pat", "mailto:pat@example.com");
    pat.hosting = Hosting::Partitioned;

    StaticDirectory::new(vec![
        local("organizer", "mailto:organizer@example.com"),
        local("attendee1", "mailto:a1@example.com"),
        local("attendee2", "mailto:a2@example.com"),
        local("bob", "mailto:bob@example.com"),
        intern,
        pat,
    ])
}

pub(crate) fn principal(uid: &str) -> Principal {
    directory()
        .principal_for_uid(uid)
        .unwrap_or_else(|| panic!("no test principal {uid}"))
}

/// Wrap VEVENT text in a VCALENDAR and parse it.
pub(crate) fn calendar(body: &str) -> Calendar {
    parse_calendar(&format!(
        "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:-//Test//Test//EN\n{body}END:VCALENDAR\n"
    ))
    .expect("Should parse")
}

#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub originator: String,
    pub recipients: Vec<String>,
    pub message: Calendar,
    pub options: DeliveryOptions,
    /// Attendee refreshes in progress when the message went out.
    pub refreshes_in_progress: usize,
}

impl Delivery {
    pub fn method(&self) -> Option<String> {
        self.message.property_value("METHOD").map(str::to_string)
    }

    pub fn recipient(&self) -> &str {
        self.recipients.first().map(String::as_str).unwrap_or_default()
    }
}

/// Transport recording every message and answering with a fixed status.
pub(crate) struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    status: String,
    transaction: Transaction,
}

impl RecordingTransport {
    pub fn new(transaction: Transaction) -> Self {
        RecordingTransport {
            deliveries: Mutex::new(Vec::new()),
            status: "2.0;Success".to_string(),
            transaction,
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(
        &self,
        originator: &str,
        recipients: &[String],
        message: &Calendar,
        options: DeliveryOptions,
    ) -> DeliveryReport {
        self.deliveries.lock().unwrap().push(Delivery {
            originator: originator.to_string(),
            recipients: recipients.to_vec(),
            message: message.clone(),
            options,
            refreshes_in_progress: self.transaction.attendee_refreshes(),
        });
        DeliveryReport::uniform(recipients, &self.status)
    }
}

/// A store, a recording transport and the transaction they share.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<RecordingTransport>,
    pub transaction: Transaction,
    pub config: SchedulingConfig,
}

impl Harness {
    pub fn new() -> Self {
        let transaction = Transaction::new();
        Harness {
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(RecordingTransport::new(transaction.clone())),
            transaction,
            config: SchedulingConfig::default(),
        }
    }

    pub fn services(&self) -> SchedulingServices {
        SchedulingServices::new(
            Arc::new(directory()),
            self.store.clone(),
            self.transport.clone(),
            self.config.clone(),
        )
    }

    /// A scheduler acting for the home of the test principal `uid`.
    pub fn scheduler(&self, uid: &str) -> ImplicitScheduler {
        ImplicitScheduler::new(self.services(), principal(uid)).with_transaction(self.transaction.clone())
    }

    /// Store `calendar` in `home` and return it as a resource.
    pub fn stored(&self, home: &str, name: &str, calendar: &Calendar) -> StoredResource {
        self.store.put(home, name, calendar.clone()).unwrap();
        StoredResource::new(name, calendar.clone())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.transport.deliveries()
    }
}
