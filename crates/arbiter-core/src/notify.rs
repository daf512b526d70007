//! Notification and site-hook capability interfaces.
//!
//! This core never composes or sends email. Status transitions and
//! high-usage alarms are handed to a [`Notifier`] as structured records;
//! the external mailer renders and delivers them using the site's
//! [`SiteHooks`]. The [`HistoryLog`] collaborator receives the full event
//! ring at the same moments for the historical store.

use chrono::{TimeZone, Utc};
use tracing::{info, warn};

use crate::model::Event;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// A user crossed the badness ceiling and entered a penalty tier.
    Violation,
    /// A penalty timed out on the host that applied it.
    Release,
    /// The node as a whole is running hot.
    HighUsage,
}

/// One notification record.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotifyKind,
    pub hostname: String,
    pub uid: u32,
    pub username: String,
    /// Current status group at the time of the notification.
    pub status: String,
    pub occurrences: u32,
    pub penalty_expiry: Option<i64>,
    /// Snapshot of the user's event ring, oldest first. Empty for
    /// node-level high-usage records.
    pub events: Vec<Event>,
    /// Peers in the sync group that this state also applies on.
    pub peer_hosts: Vec<String>,
    /// Debug mode: deliver to admins only, with the debug marker.
    pub debug: bool,
}

/// Site-specific integration points, threaded into the notifier instead
/// of loaded dynamically from a hook file.
pub trait SiteHooks: Send {
    /// Mail address for a uid; `None` suppresses the user copy.
    fn email_address_of(&self, uid: u32, username: &str) -> Option<String>;

    fn warning_subject(&self, n: &Notification) -> String;

    /// Plain-text body handed to the external mailer.
    fn warning_body(&self, n: &Notification) -> String;
}

/// Default hooks: `user@domain` addressing and a plain subject line.
pub struct DefaultHooks {
    /// Mail domain appended to usernames; `None` means no user email.
    pub domain: Option<String>,
}

impl SiteHooks for DefaultHooks {
    fn email_address_of(&self, _uid: u32, username: &str) -> Option<String> {
        self.domain.as_ref().map(|d| format!("{username}@{d}"))
    }

    fn warning_subject(&self, n: &Notification) -> String {
        let marker = if n.debug { "[DEBUG] " } else { "" };
        let until = n
            .penalty_expiry
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|t| format!(" until {}", t.format("%Y-%m-%d %H:%M UTC")))
            .unwrap_or_default();
        match n.kind {
            NotifyKind::Violation => format!(
                "{marker}Resource violation by {} on {} (status: {}, occurrence {}{until})",
                n.username, n.hostname, n.status, n.occurrences
            ),
            NotifyKind::Release => format!(
                "{marker}Penalty lifted for {} on {}",
                n.username, n.hostname
            ),
            NotifyKind::HighUsage => {
                format!("{marker}High usage on {}", n.hostname)
            }
        }
    }

    fn warning_body(&self, n: &Notification) -> String {
        let mut body = self.warning_subject(n);
        body.push('\n');
        if !n.peer_hosts.is_empty() {
            body.push_str(&format!(
                "This state also applies on: {}\n",
                n.peer_hosts.join(", ")
            ));
        }
        if let Some(event) = n.events.last() {
            body.push_str(&format!(
                "Recent usage: {:.0}% CPU, {} bytes memory ({} processes)\n",
                event.cpu_pct,
                event.mem_bytes,
                event.procs.len()
            ));
        }
        body
    }
}

/// Consumer of notification records.
pub trait Notifier: Send {
    fn notify(&mut self, notification: Notification);
}

/// Notifier that writes to the log. Stands in wherever the external
/// mailer is not wired up (and in every test).
pub struct LogNotifier {
    hooks: Box<dyn SiteHooks>,
}

impl LogNotifier {
    pub fn new(hooks: Box<dyn SiteHooks>) -> Self {
        Self { hooks }
    }
}

impl Notifier for LogNotifier {
    fn notify(&mut self, n: Notification) {
        let subject = self.hooks.warning_subject(&n);
        let rcpt = self.hooks.email_address_of(n.uid, &n.username);
        match n.kind {
            NotifyKind::Violation => warn!(
                uid = n.uid,
                user = %n.username,
                status = %n.status,
                occurrences = n.occurrences,
                peers = ?n.peer_hosts,
                rcpt = rcpt.as_deref().unwrap_or("-"),
                "{subject}"
            ),
            NotifyKind::Release | NotifyKind::HighUsage => info!(
                uid = n.uid,
                user = %n.username,
                rcpt = rcpt.as_deref().unwrap_or("-"),
                "{subject}"
            ),
        }
    }
}

/// Consumer of event history at status transitions and high-usage
/// moments. The SQLite-backed store lives outside this crate.
pub trait HistoryLog: Send {
    fn record_transition(&mut self, uid: u32, username: &str, events: &[Event]);

    fn record_high_usage(&mut self, cpu_pct_of_node: f64, mem_frac_of_node: f64);
}

/// History sink that drops everything.
pub struct NullHistory;

impl HistoryLog for NullHistory {
    fn record_transition(&mut self, _uid: u32, _username: &str, _events: &[Event]) {}

    fn record_high_usage(&mut self, _cpu: f64, _mem: f64) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Notifier that remembers everything it was handed.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingNotifier {
        pub records: Arc<Mutex<Vec<Notification>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&mut self, notification: Notification) {
            self.records.lock().unwrap().push(notification);
        }
    }

    fn notification(kind: NotifyKind, debug: bool) -> Notification {
        Notification {
            kind,
            hostname: "node1".to_string(),
            uid: 1000,
            username: "alice".to_string(),
            status: "penalty1".to_string(),
            occurrences: 1,
            penalty_expiry: Some(1800),
            events: vec![],
            peer_hosts: vec![],
            debug,
        }
    }

    #[test]
    fn test_default_hooks_addressing() {
        let hooks = DefaultHooks {
            domain: Some("example.edu".to_string()),
        };
        assert_eq!(
            hooks.email_address_of(1000, "alice").as_deref(),
            Some("alice@example.edu")
        );

        let no_mail = DefaultHooks { domain: None };
        assert_eq!(no_mail.email_address_of(1000, "alice"), None);
    }

    #[test]
    fn test_debug_marker_prefixes_subject() {
        let hooks = DefaultHooks { domain: None };
        let subject = hooks.warning_subject(&notification(NotifyKind::Violation, true));
        assert!(subject.starts_with("[DEBUG] "));
        let subject = hooks.warning_subject(&notification(NotifyKind::Violation, false));
        assert!(!subject.contains("DEBUG"));
    }

    #[test]
    fn test_subjects_name_the_user_and_host() {
        let hooks = DefaultHooks { domain: None };
        let subject = hooks.warning_subject(&notification(NotifyKind::Release, false));
        assert!(subject.contains("alice"));
        assert!(subject.contains("node1"));
    }

    #[test]
    fn test_body_lists_peer_hosts() {
        let hooks = DefaultHooks { domain: None };
        let mut n = notification(NotifyKind::Violation, false);
        n.peer_hosts = vec!["node2".to_string(), "node3".to_string()];

        let body = hooks.warning_body(&n);
        assert!(body.contains("node2, node3"));
    }
}
