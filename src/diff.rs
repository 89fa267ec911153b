//! Key/Value Diff Engine: section- and key-level diffs between two parsed
//! INI documents. Used by the file-watch engine for configuration-format
//! files and by the hot-reload coordinator for the process's own config
//! file.

use ini::Ini;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDiff {
    pub operation: Operation,
    pub section: String,
    pub old_text: String,
    pub new_text: String,
}

/// Diff two parsed documents: symmetric difference of section names, then
/// for each common section, symmetric difference of key names plus a
/// Modify for every common key whose value differs.
pub fn diff(old: &Ini, new: &Ini) -> Vec<SectionDiff> {
    let mut out = Vec::new();

    let old_sections = section_names(old);
    let new_sections = section_names(new);

    for name in old_sections.difference(&new_sections) {
        out.push(SectionDiff {
            operation: Operation::Remove,
            section: name.clone(),
            old_text: serialize_section(old, name),
            new_text: String::new(),
        });
    }

    for name in new_sections.difference(&old_sections) {
        out.push(SectionDiff {
            operation: Operation::Add,
            section: name.clone(),
            old_text: String::new(),
            new_text: serialize_section(new, name),
        });
    }

    for name in old_sections.intersection(&new_sections) {
        out.extend(diff_keys(old, new, name));
    }

    out
}

fn section_names(doc: &Ini) -> HashSet<String> {
    doc.sections().filter_map(|s| s.map(|s| s.to_string())).collect()
}

fn serialize_section(doc: &Ini, name: &str) -> String {
    let mut s = format!("{name}:\n");
    if let Some(sec) = doc.section(Some(name)) {
        for (k, v) in sec.iter() {
            s.push_str(&format!("{k}={v}\n"));
        }
    }
    s
}

fn diff_keys(old: &Ini, new: &Ini, section: &str) -> Vec<SectionDiff> {
    let mut out = Vec::new();

    let old_sec = match old.section(Some(section)) {
        Some(s) => s,
        None => return out,
    };
    let new_sec = match new.section(Some(section)) {
        Some(s) => s,
        None => return out,
    };

    let old_keys: HashSet<String> = old_sec.iter().map(|(k, _)| k.to_string()).collect();
    let new_keys: HashSet<String> = new_sec.iter().map(|(k, _)| k.to_string()).collect();

    for key in old_keys.difference(&new_keys) {
        let value = old_sec.get(key.as_str()).unwrap_or_default();
        out.push(SectionDiff {
            operation: Operation::Remove,
            section: section.to_string(),
            old_text: format!("{section}: {key}={value}"),
            new_text: String::new(),
        });
    }

    for key in new_keys.difference(&old_keys) {
        let value = new_sec.get(key.as_str()).unwrap_or_default();
        out.push(SectionDiff {
            operation: Operation::Add,
            section: section.to_string(),
            old_text: String::new(),
            new_text: format!("{section}: {key}={value}"),
        });
    }

    for key in old_keys.intersection(&new_keys) {
        let old_value = old_sec.get(key.as_str()).unwrap_or_default();
        let new_value = new_sec.get(key.as_str()).unwrap_or_default();
        if old_value != new_value {
            out.push(SectionDiff {
                operation: Operation::Modify,
                section: section.to_string(),
                old_text: format!("{section}: {key}={old_value}"),
                new_text: format!("{section}: {key}={new_value}"),
            });
        }
    }

    out
}

/// The set of section names touched by a diff, used by the hot-reload
/// coordinator to classify which region of the config changed.
pub fn changed_sections(diffs: &[SectionDiff]) -> HashSet<String> {
    diffs.iter().map(|d| d.section.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn load(s: &str) -> Ini {
        Ini::load_from_str(s).unwrap()
    }

    #[test]
    fn detects_added_and_removed_sections() {
        let old = load("[A]\nk=1\n");
        let new = load("[B]\nk=1\n");
        let d = diff(&old, &new);
        assert!(d.iter().any(|x| x.operation == Operation::Remove && x.section == "A"));
        assert!(d.iter().any(|x| x.operation == Operation::Add && x.section == "B"));
    }

    #[test]
    fn detects_modified_key_in_common_section() {
        let old = load("[A]\nk=1\n");
        let new = load("[A]\nk=2\n");
        let d = diff(&old, &new);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].operation, Operation::Modify);
        assert_eq!(d[0].old_text, "A: k=1");
        assert_eq!(d[0].new_text, "A: k=2");
    }

    #[test]
    fn add_diff_has_empty_old_text() {
        let old = load("[A]\nk=1\n");
        let new = load("[A]\nk=1\nk2=2\n");
        let d = diff(&old, &new);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].operation, Operation::Add);
        assert_eq!(d[0].old_text, "");
        assert_eq!(d[0].new_text, "A: k2=2");
    }

    #[test]
    fn remove_diff_has_empty_new_text() {
        let old = load("[A]\nk=1\nk2=2\n");
        let new = load("[A]\nk=1\n");
        let d = diff(&old, &new);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].operation, Operation::Remove);
        assert_eq!(d[0].new_text, "");
    }

    #[test]
    fn no_diffs_for_identical_documents() {
        let old = load("[A]\nk=1\n[B]\nx=y\n");
        let new = load("[A]\nk=1\n[B]\nx=y\n");
        assert!(diff(&old, &new).is_empty());
    }

    #[test]
    fn diff_is_left_inverse_of_edit() {
        // Applying the computed diff's new values back to the old document
        // then re-diffing should reproduce the same Modify set.
        let old = load("[A]\nk=1\nm=9\n");
        let new = load("[A]\nk=2\nm=9\n");
        let d1 = diff(&old, &new);

        let mut applied = old.clone();
        for sd in &d1 {
            if sd.operation == Operation::Modify {
                if let Some((_, kv)) = sd.new_text.split_once(':') {
                    if let Some((k, v)) = kv.trim().split_once('=') {
                        applied.set_to(Some(sd.section.as_str()), k.to_string(), v.to_string());
                    }
                }
            }
        }

        let d2 = diff(&old, &applied);
        assert_eq!(changed_sections(&d1), changed_sections(&d2));
    }

    proptest! {
        /// diff is a left inverse of edit: applying a single key's new value
        /// from the computed diff, then re-diffing, changes nothing further
        /// in that key's section.
        #[test]
        fn diff_left_inverse_holds_for_arbitrary_values(
            old_val in "[a-z0-9]{1,8}",
            new_val in "[a-z0-9]{1,8}",
        ) {
            let old = load(&format!("[A]\nk={old_val}\n"));
            let new = load(&format!("[A]\nk={new_val}\n"));

            let d1 = diff(&old, &new);
            let mut applied = old.clone();
            for sd in &d1 {
                if sd.operation == Operation::Modify {
                    if let Some((_, kv)) = sd.new_text.split_once(':') {
                        if let Some((k, v)) = kv.trim().split_once('=') {
                            applied.set_to(Some(sd.section.as_str()), k.to_string(), v.to_string());
                        }
                    }
                }
            }

            let d2 = diff(&old, &applied);
            prop_assert_eq!(changed_sections(&d1), changed_sections(&d2));
        }
    }
}
