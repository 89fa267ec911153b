//! Config Store: parses the INI configuration file into an immutable
//! [`Snapshot`] and serves the current one atomically to every other
//! component.
//!
//! Section names and keys follow the canonical spelling documented in the
//! external interfaces: `CommonData`, `CommonEmail`, `MonitorServiceSpec`,
//! `MonitorServicePart`, `MonitorServiceTimer`, `MonitorFileDir`,
//! `MonitorFileSpec`. Unknown keys are ignored; missing sections fall back
//! to defaults.

use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use ini::Ini;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SECTION_COMMON_DATA: &str = "CommonData";
pub const SECTION_COMMON_EMAIL: &str = "CommonEmail";
pub const SECTION_SERVICE_SPEC: &str = "MonitorServiceSpec";
pub const SECTION_SERVICE_PART: &str = "MonitorServicePart";
pub const SECTION_SERVICE_TIMER: &str = "MonitorServiceTimer";
pub const SECTION_FILE_DIR: &str = "MonitorFileDir";
pub const SECTION_FILE_SPEC: &str = "MonitorFileSpec";

const DEFAULT_MACHINE_NAME: &str = "Unknow Machine Name";
const DEFAULT_REFRESH_SECS: u64 = 300;

/// A positive or excluding prefix pattern from `[MonitorServicePart]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPattern {
    pub prefix: String,
    pub exclude: bool,
}

impl PartialPattern {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(rest) => PartialPattern { prefix: rest.trim().to_string(), exclude: true },
            None => PartialPattern { prefix: raw.trim().to_string(), exclude: false },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(self.prefix.as_str())
    }
}

/// One entry from `[MonitorFileSpec]`: an explicit path, or (with a leading
/// `!`) an instruction to suppress a directory-derived entry of that name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpecEntry {
    pub path: String,
    pub exclude: bool,
}

impl FileSpecEntry {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(rest) => FileSpecEntry { path: rest.trim().to_string(), exclude: true },
            None => FileSpecEntry { path: raw.trim().to_string(), exclude: false },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifierSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub send_user: String,
    pub send_pass: String,
    pub recipients: Vec<String>,
}

/// Immutable configuration snapshot. Produced atomically on load; readers
/// hold an `Arc` so a reload never invalidates an in-flight read.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub machine_name: String,
    /// Service name -> optional attachment directory.
    pub specific_services: HashMap<String, Option<PathBuf>>,
    /// Ordered prefix patterns; order only matters for determinism of tests.
    pub partial_patterns: Vec<PartialPattern>,
    /// Watched directory -> comma-separated suffix list (already split).
    pub file_dirs: HashMap<PathBuf, Vec<String>>,
    pub file_specs: Vec<FileSpecEntry>,
    pub notifier: NotifierSettings,
    pub refresh_interval: Duration,
    /// `None` when `LogFileSize` was absent from the file (distinct from 0).
    pub log_file_size_mb: Option<u64>,
}

impl Snapshot {
    pub fn attachment_dir_for(&self, service: &str) -> Option<&Path> {
        self.specific_services.get(service).and_then(|v| v.as_deref())
    }
}

/// Parse an already-loaded `Ini` document into a [`Snapshot`].
pub fn parse_snapshot(doc: &Ini) -> Snapshot {
    let mut snap = Snapshot::default();

    if let Some(sec) = doc.section(Some(SECTION_COMMON_DATA)) {
        snap.machine_name = sec
            .get("MachineName")
            .unwrap_or(DEFAULT_MACHINE_NAME)
            .to_string();
        // Presence of the key matters, not just a non-zero value: an absent
        // key means "no cap configured", not "cap of zero".
        snap.log_file_size_mb = sec.get("LogFileSize").and_then(|v| v.parse::<u64>().ok());
    } else {
        snap.machine_name = DEFAULT_MACHINE_NAME.to_string();
    }

    if let Some(sec) = doc.section(Some(SECTION_COMMON_EMAIL)) {
        let open = sec.get("Open").and_then(|v| v.parse::<u8>().ok()).unwrap_or(0);
        snap.notifier = NotifierSettings {
            enabled: open != 0,
            host: sec.get("Host").unwrap_or("127.0.0.1").to_string(),
            port: sec.get("Port").and_then(|v| v.parse().ok()).unwrap_or(25),
            send_user: sec.get("SendU").unwrap_or_default().to_string(),
            send_pass: sec.get("SendP").unwrap_or_default().to_string(),
            recipients: sec
                .get("ReceiveU")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        };
    }

    if let Some(sec) = doc.section(Some(SECTION_SERVICE_SPEC)) {
        let mut seen_suffixes = HashSet::new();
        for (key, _) in sec.iter() {
            let Some(n) = numeric_suffix(key, "Name") else { continue };
            if !seen_suffixes.insert(n.clone()) {
                continue;
            }
            let Some(name) = sec.get(format!("Name{n}")) else { continue };
            let attach = sec.get(format!("Attach{n}")).map(PathBuf::from);
            snap.specific_services.insert(name.to_string(), attach);
        }
    }

    if let Some(sec) = doc.section(Some(SECTION_SERVICE_PART)) {
        let mut names: Vec<(String, String)> = sec
            .iter()
            .filter_map(|(k, v)| numeric_suffix(k, "Name").map(|n| (n, v.to_string())))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, raw) in names {
            snap.partial_patterns.push(PartialPattern::parse(&raw));
        }
    }

    if let Some(sec) = doc.section(Some(SECTION_SERVICE_TIMER)) {
        let secs = sec
            .get("RefreshSCMTime")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REFRESH_SECS);
        snap.refresh_interval = Duration::from_secs(secs);
    } else {
        snap.refresh_interval = Duration::from_secs(DEFAULT_REFRESH_SECS);
    }

    if let Some(sec) = doc.section(Some(SECTION_FILE_DIR)) {
        let mut paths: Vec<(String, String)> = sec
            .iter()
            .filter_map(|(k, v)| numeric_suffix(k, "Path").map(|n| (n, v.to_string())))
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        for (n, path) in paths {
            let suffixes = sec
                .get(format!("Type{n}"))
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            snap.file_dirs.insert(PathBuf::from(path), suffixes);
        }
    }

    if let Some(sec) = doc.section(Some(SECTION_FILE_SPEC)) {
        for (_, v) in sec.iter() {
            snap.file_specs.push(FileSpecEntry::parse(v));
        }
    }

    snap
}

/// Suffix of `key` following `prefix`, if `key` is exactly `prefix` followed
/// by decimal digits (e.g. `numeric_suffix("Name12", "Name") == Some("12")`).
fn numeric_suffix<'a>(key: &'a str, prefix: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Load a snapshot from `path`, bootstrapping a commented default file the
/// first time the path does not exist.
pub fn load(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        bootstrap_default(path)?;
    }

    let doc = Ini::load_from_file(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(parse_snapshot(&doc))
}

fn bootstrap_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
    }

    info!(path = %path.display(), "writing default configuration file");

    let template = format!(
        "; [{common}] machine identity and log size cap\n\
         ; [{email}] SMTP notifier settings\n\
         ; [{spec}] explicitly named services to monitor (Name<n>/Attach<n>)\n\
         ; [{part}] prefix-matched services to monitor; a leading ! excludes\n\
         ; [{timer}] periodic refresh interval in seconds\n\
         ; [{fdir}] directories to watch recursively (Path<n>/Type<n> suffix list)\n\
         ; [{fspec}] individual files to watch; a leading ! suppresses a directory match\n\
         \n\
         [{common}]\n\
         MachineName=localhost\n\
         LogFileSize=800\n\
         \n\
         [{email}]\n\
         Open=0\n\
         Host=smtp.example.com\n\
         Port=25\n\
         SendU=alerts@example.com\n\
         SendP=changeme\n\
         ReceiveU=oncall@example.com\n\
         \n\
         [{spec}]\n\
         ; Name1=myservice\n\
         ; Attach1=/var/log/myservice\n\
         \n\
         [{part}]\n\
         ; Name1=myprefix-\n\
         ; Name2=!myprefix-excluded\n\
         \n\
         [{timer}]\n\
         RefreshSCMTime={refresh}\n\
         \n\
         [{fdir}]\n\
         ; Path1=/etc/myapp\n\
         ; Type1=ini,conf\n\
         \n\
         [{fspec}]\n\
         ; File1=/etc/myapp/extra.ini\n",
        common = SECTION_COMMON_DATA,
        email = SECTION_COMMON_EMAIL,
        spec = SECTION_SERVICE_SPEC,
        part = SECTION_SERVICE_PART,
        timer = SECTION_SERVICE_TIMER,
        fdir = SECTION_FILE_DIR,
        fspec = SECTION_FILE_SPEC,
        refresh = DEFAULT_REFRESH_SECS,
    );

    fs::write(path, template).map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e }.into())
}

/// Walk each configured directory recursively, keep files whose name ends
/// with one of that directory's suffixes, add each explicit file, then drop
/// any explicit entry marked with a leading `!`. Duplicates are removed.
pub fn materialize_file_list(snap: &Snapshot) -> HashSet<PathBuf> {
    let mut out: HashSet<PathBuf> = HashSet::new();

    for (dir, suffixes) in &snap.file_dirs {
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if suffixes.is_empty() || suffixes.iter().any(|suf| name.ends_with(suf.as_str())) {
                out.insert(entry.into_path());
            }
        }
    }

    let mut filters: HashSet<PathBuf> = HashSet::new();
    for spec in &snap.file_specs {
        if spec.exclude {
            filters.insert(PathBuf::from(&spec.path));
        } else {
            out.insert(PathBuf::from(&spec.path));
        }
    }

    out.retain(|p| !filters.contains(p));

    out
}

/// Atomically-swapped holder for the current [`Snapshot`], grounded in the
/// same lock-free publish pattern used elsewhere in this codebase for
/// hot-reloadable state.
pub struct Store {
    path: PathBuf,
    current: ArcSwap<Snapshot>,
}

impl Store {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snap = load(&path)?;
        Ok(Self { path, current: ArcSwap::from_pointee(snap) })
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload from disk and publish the new snapshot. On failure the
    /// previous snapshot remains in effect (caller is expected to log).
    pub fn reload(&self) -> Result<Arc<Snapshot>> {
        match load(&self.path) {
            Ok(snap) => {
                let arc = Arc::new(snap);
                self.current.store(arc.clone());
                crate::metrics::record_config_reload();
                Ok(arc)
            },
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous snapshot");
                crate::metrics::record_config_reload_failed();
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_ini(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_specific_services_with_attachments() {
        let f = write_ini(
            "[MonitorServiceSpec]\nName1=svcA\nAttach1=/var/log/a\nName2=svcB\n",
        );
        let doc = Ini::load_from_file(f.path()).unwrap();
        let snap = parse_snapshot(&doc);
        assert_eq!(snap.specific_services.get("svcA").unwrap().as_deref(), Some(Path::new("/var/log/a")));
        assert_eq!(snap.specific_services.get("svcB").unwrap().as_deref(), None);
    }

    #[test]
    fn parses_partial_patterns_preserving_exclusion_prefix() {
        let f = write_ini("[MonitorServicePart]\nName1=!svcX\nName2=svcY\n");
        let doc = Ini::load_from_file(f.path()).unwrap();
        let snap = parse_snapshot(&doc);
        assert_eq!(snap.partial_patterns.len(), 2);
        assert!(snap.partial_patterns[0].exclude);
        assert_eq!(snap.partial_patterns[0].prefix, "svcX");
        assert!(!snap.partial_patterns[1].exclude);
    }

    #[test]
    fn log_file_size_absent_is_none_not_zero() {
        let f = write_ini("[CommonData]\nMachineName=box1\n");
        let doc = Ini::load_from_file(f.path()).unwrap();
        let snap = parse_snapshot(&doc);
        assert_eq!(snap.log_file_size_mb, None);
    }

    #[test]
    fn refresh_interval_defaults_to_300_seconds() {
        let doc = Ini::new();
        let snap = parse_snapshot(&doc);
        assert_eq!(snap.refresh_interval, Duration::from_secs(300));
    }

    #[test]
    fn materialize_file_list_applies_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ini"), "").unwrap();
        std::fs::write(dir.path().join("b.ini"), "").unwrap();

        let mut snap = Snapshot::default();
        snap.file_dirs.insert(dir.path().to_path_buf(), vec!["ini".to_string()]);
        snap.file_specs.push(FileSpecEntry {
            path: dir.path().join("b.ini").to_string_lossy().to_string(),
            exclude: true,
        });

        let files = materialize_file_list(&snap);
        assert!(files.iter().any(|p| p.ends_with("a.ini")));
        assert!(!files.iter().any(|p| p.ends_with("b.ini")));
    }

    #[test]
    fn exclusion_is_exact_path_not_suffix() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("b.ini"), "").unwrap();
        std::fs::write(dir_b.path().join("sub_b.ini"), "").unwrap();

        let mut snap = Snapshot::default();
        snap.file_dirs.insert(dir_a.path().to_path_buf(), vec!["ini".to_string()]);
        snap.file_dirs.insert(dir_b.path().to_path_buf(), vec!["ini".to_string()]);
        snap.file_specs.push(FileSpecEntry {
            path: dir_a.path().join("b.ini").to_string_lossy().to_string(),
            exclude: true,
        });

        let files = materialize_file_list(&snap);
        assert!(!files.iter().any(|p| p.ends_with("b.ini") && p.starts_with(dir_a.path())));
        assert!(files.iter().any(|p| p.ends_with("sub_b.ini")));
    }

    #[test]
    fn store_bootstraps_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitorCfg").join("config.ini");
        let store = Store::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.current().machine_name, "localhost");
    }
}
