use std::collections::BTreeSet;

use crate::models::fields::{self, values};
use crate::models::record::{Record, RecordMap};
use crate::state::RecordState;

/// Generates human-readable record ids of the form `<Author><year>`.
#[derive(Debug, Default)]
pub struct IdSetter;

impl IdSetter {
    /// Base id without collision suffix, e.g. `Smith2020`.
    pub fn base_id(record: &Record) -> String {
        let family = record
            .value(fields::AUTHOR)
            .filter(|a| *a != values::UNKNOWN)
            .and_then(|authors| authors.split(" and ").next())
            .map(|first| {
                // "Family, Given" or "Given Family"
                match first.split_once(',') {
                    Some((family, _)) => family.trim().to_string(),
                    None => first.split_whitespace().last().unwrap_or("").to_string(),
                }
            })
            .map(|family| capitalize(&family.chars().filter(|c| c.is_alphanumeric()).collect::<String>()))
            .filter(|family| !family.is_empty())
            .unwrap_or_else(|| "Anonymous".to_string());

        let year = record
            .value(fields::YEAR)
            .filter(|y| *y != values::UNKNOWN)
            .unwrap_or("");
        format!("{family}{year}")
    }

    /// Assigns ids to every record that is still before `md_processed`.
    /// Records further along keep their id. Returns the `(old, new)` pairs
    /// of changed ids.
    pub fn set_ids(records: &mut RecordMap) -> Vec<(String, String)> {
        let (fixed, mutable): (Vec<Record>, Vec<Record>) = std::mem::take(records)
            .into_values()
            .partition(|r| r.status() >= RecordState::MdProcessed);

        let mut taken: BTreeSet<String> = fixed.iter().map(|r| r.id.clone()).collect();
        for record in fixed {
            records.insert(record.id.clone(), record);
        }

        let mut changed = Vec::new();
        for mut record in mutable {
            let new_id = Self::next_free(&Self::base_id(&record), &taken);
            taken.insert(new_id.clone());
            if new_id != record.id {
                changed.push((record.id.clone(), new_id.clone()));
                record.id = new_id;
            }
            records.insert(record.id.clone(), record);
        }
        changed
    }

    fn next_free(base: &str, taken: &BTreeSet<String>) -> String {
        if !taken.contains(base) {
            return base.to_string();
        }
        let mut n = 0usize;
        loop {
            let candidate = format!("{base}{}", suffix(n));
            if !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// `a`..`z`, then `aa`, `ab`, ...
fn suffix(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.iter().rev().collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, author: &str, year: &str) -> Record {
        let mut r = Record::new(id, "article");
        r.add_origin(format!("feed/{id}"));
        r.update_field(fields::AUTHOR, author, "feed");
        r.update_field(fields::YEAR, year, "feed");
        r
    }

    #[test]
    fn base_id_uses_first_family_name() {
        assert_eq!(IdSetter::base_id(&rec("x", "Smith, Jane and Doe, J.", "2020")), "Smith2020");
        assert_eq!(IdSetter::base_id(&rec("x", "Jane van DYKE", "2021")), "Dyke2021");
        assert_eq!(IdSetter::base_id(&rec("x", "UNKNOWN", "2021")), "Anonymous2021");
    }

    #[test]
    fn collisions_get_suffixes() {
        let mut records = RecordMap::new();
        for id in ["r1", "r2", "r3"] {
            records.insert(id.to_string(), rec(id, "Smith, Jane", "2020"));
        }
        let changed = IdSetter::set_ids(&mut records);
        assert_eq!(changed.len(), 3);
        let ids: Vec<&String> = records.keys().collect();
        assert_eq!(ids, ["Smith2020", "Smith2020a", "Smith2020b"]);
    }

    #[test]
    fn processed_records_keep_their_ids() {
        let mut records = RecordMap::new();
        let mut done = rec("Smith2020", "Smith, Jane", "2020");
        done.force_status(RecordState::MdProcessed);
        records.insert(done.id.clone(), done);
        records.insert("new".to_string(), rec("new", "Smith, Jane", "2020"));

        IdSetter::set_ids(&mut records);
        assert!(records.contains_key("Smith2020"));
        assert!(records.contains_key("Smith2020a"));
        assert_eq!(records["Smith2020"].status(), RecordState::MdProcessed);
    }

    #[test]
    fn suffix_sequence() {
        assert_eq!(suffix(0), "a");
        assert_eq!(suffix(25), "z");
        assert_eq!(suffix(26), "aa");
    }
}
