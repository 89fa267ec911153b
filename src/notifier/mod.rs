//! Notifier: sends a restart alert by SMTP, with an optional attachment.
//!
//! Holds the notifier settings of the latest snapshot behind a lock so
//! [`Notifier::update`] can swap them atomically from the hot-reload
//! coordinator without interrupting an in-flight send.

use crate::config::NotifierSettings;
use crate::error::NotifyError;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed,
    Skipped,
}

pub struct Notifier {
    settings: RwLock<NotifierSettings>,
}

impl Notifier {
    pub fn new(settings: NotifierSettings) -> Self {
        Self { settings: RwLock::new(settings) }
    }

    pub fn update(&self, settings: NotifierSettings) {
        *self.settings.write() = settings;
    }

    /// Send `subject`/`body` to every configured recipient. `attachment_path`
    /// may name a directory (the newest regular file inside is attached) or
    /// a plain file (attached directly).
    pub fn send(&self, subject: &str, body: &str, attachment_path: Option<&Path>) -> SendOutcome {
        let settings = self.settings.read().clone();
        if !settings.enabled {
            crate::metrics::record_notification_skipped();
            return SendOutcome::Skipped;
        }

        let resolved = attachment_path.and_then(resolve_attachment);

        let mut failed = false;
        for recipient in &settings.recipients {
            match send_one(&settings, recipient, subject, body, resolved.as_deref()) {
                Ok(()) => info!(%recipient, subject, "notification sent"),
                Err(e) => {
                    warn!(%recipient, error = %e, "notification send failed");
                    failed = true;
                },
            }
        }

        if failed {
            SendOutcome::Failed
        } else {
            crate::metrics::record_notification_sent();
            SendOutcome::Sent
        }
    }
}

fn send_one(
    settings: &NotifierSettings,
    recipient: &str,
    subject: &str,
    body: &str,
    attachment_path: Option<&Path>,
) -> Result<(), NotifyError> {
    let from = settings
        .send_user
        .parse()
        .map_err(|e| NotifyError::Message(format!("invalid sender address: {e}")))?;
    let to = recipient
        .parse()
        .map_err(|e| NotifyError::Message(format!("invalid recipient address {recipient}: {e}")))?;

    let email_builder = Message::builder().from(from).to(to).subject(subject.to_string());

    let email = if let Some(path) = attachment_path {
        let contents = fs::read(path)
            .map_err(|e| NotifyError::Message(format!("reading attachment {}: {e}", path.display())))?;
        let filename = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let attachment = Attachment::new(filename)
            .body(contents, "application/octet-stream".parse().unwrap());
        email_builder
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::html(body.to_string()))
                    .singlepart(attachment),
            )
            .map_err(|e| NotifyError::Message(format!("building message: {e}")))?
    } else {
        email_builder
            .header(lettre::message::header::ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| NotifyError::Message(format!("building message: {e}")))?
    };

    let creds = Credentials::new(settings.send_user.clone(), settings.send_pass.clone());
    let transport = SmtpTransport::relay(&settings.host)
        .map_err(|e| NotifyError::Transport(format!("smtp relay setup: {e}")))?
        .port(settings.port)
        .credentials(creds)
        .build();

    transport.send(&email).map_err(|e| NotifyError::Transport(format!("smtp send: {e}")))?;
    Ok(())
}

/// Resolve a configured attachment path: a file is attached directly, a
/// directory has its newest regular file attached. Mirrors the ground
/// truth's `GetAttachByPath`, which returns the path itself when it is not
/// a directory.
fn resolve_attachment(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        Some(path.to_path_buf())
    } else {
        newest_file_in(path)
    }
}

/// The most-recently-modified non-directory entry in `dir`, non-recursive.
/// Returns `None` if `dir` is missing, empty, or contains no regular file.
fn newest_file_in(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;

    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };
        if newest.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
            newest = Some((entry.path(), modified));
        }
    }

    newest.map(|(path, _)| path)
}

/// Build the canonical subject line for a service restart notification.
pub fn restart_subject(machine_name: &str, service_name: &str) -> String {
    format!("machine:{machine_name} service: {service_name} has stop and restart!")
}

pub const RESTART_BODY: &str = "<b>please handle</b>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_when_disabled() {
        let notifier = Notifier::new(NotifierSettings::default());
        let outcome = notifier.send("subject", "body", None);
        assert_eq!(outcome, SendOutcome::Skipped);
    }

    #[test]
    fn subject_matches_canonical_format() {
        assert_eq!(
            restart_subject("box1", "svcA"),
            "machine:box1 service: svcA has stop and restart!"
        );
    }

    #[test]
    fn newest_file_in_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_file_in(dir.path()).is_none());
    }

    #[test]
    fn newest_file_in_missing_dir_is_none() {
        assert!(newest_file_in(Path::new("/nonexistent/does/not/exist")).is_none());
    }

    #[test]
    fn resolve_attachment_passes_through_a_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.log");
        fs::write(&file, "x").unwrap();
        assert_eq!(resolve_attachment(&file), Some(file));
    }

    #[test]
    fn resolve_attachment_picks_newest_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("a.log");
        let newer = dir.path().join("b.log");
        fs::write(&older, "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&newer, "b").unwrap();
        assert_eq!(resolve_attachment(dir.path()), Some(newer));
    }

    #[test]
    fn newest_file_picks_most_recently_modified() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("a.log");
        let newer = dir.path().join("b.log");
        fs::write(&older, "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&newer, "b").unwrap();
        assert_eq!(newest_file_in(dir.path()), Some(newer));
    }
}
