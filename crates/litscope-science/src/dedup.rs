//! Duplicate detection over records: identifier blocking plus fuzzy
//! title/author/year matching.

use std::collections::{BTreeMap, BTreeSet};

use litscope_core::models::fields::{self, values};
use litscope_core::Record;

use crate::identifiers::{Doi, Isbn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStrategy {
    Doi,
    Isbn,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// Record ids, sorted.
    pub ids: Vec<String>,
    pub strategy: DedupStrategy,
}

#[derive(Debug, Clone)]
pub struct DuplicateFinder {
    title_threshold: f64,
    author_threshold: f64,
}

impl Default for DuplicateFinder {
    fn default() -> Self {
        Self {
            title_threshold: 0.91,
            author_threshold: 0.85,
        }
    }
}

impl DuplicateFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title_threshold(mut self, threshold: f64) -> Self {
        self.title_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_author_threshold(mut self, threshold: f64) -> Self {
        self.author_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn find_by_doi(&self, records: &[&Record]) -> Vec<DuplicateGroup> {
        let buckets = bucket(records, |r| {
            r.value(fields::DOI)
                .and_then(|raw| Doi::parse(raw).ok())
                .map(|doi| vec![doi.normalized])
                .unwrap_or_default()
        });
        components(records, buckets, &[], DedupStrategy::Doi)
    }

    /// ISBN-10 and ISBN-13 forms of the same book match.
    pub fn find_by_isbn(&self, records: &[&Record]) -> Vec<DuplicateGroup> {
        let buckets = bucket(records, |r| {
            r.value(fields::ISBN)
                .map(|raw| Isbn::parse_all(raw).into_iter().map(|i| i.isbn13).collect())
                .unwrap_or_default()
        });
        components(records, buckets, &[], DedupStrategy::Isbn)
    }

    /// Same (or unknown) year, near-identical normalized title and a similar
    /// first author.
    pub fn find_fuzzy(&self, records: &[&Record]) -> Vec<DuplicateGroup> {
        let keys: Vec<FuzzyKey> = records.iter().map(|r| FuzzyKey::of(r)).collect();
        let mut pairs = Vec::new();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                if self.similar(&keys[i], &keys[j]) {
                    pairs.push((i, j));
                }
            }
        }
        components(records, BTreeMap::new(), &pairs, DedupStrategy::Fuzzy)
    }

    /// Every strategy combined; overlapping groups are joined.
    pub fn find_all(&self, records: &[&Record]) -> Vec<Vec<String>> {
        let index: BTreeMap<&str, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.as_str(), i))
            .collect();
        let mut dsu = DisjointSet::new(records.len());
        let mut grouped = BTreeSet::new();
        for group in self
            .find_by_doi(records)
            .into_iter()
            .chain(self.find_by_isbn(records))
            .chain(self.find_fuzzy(records))
        {
            let members: Vec<usize> = group.ids.iter().filter_map(|id| index.get(id.as_str()).copied()).collect();
            if let Some((first, rest)) = members.split_first() {
                grouped.insert(*first);
                for idx in rest {
                    grouped.insert(*idx);
                    dsu.union(*first, *idx);
                }
            }
        }

        let mut by_root: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for idx in grouped {
            by_root.entry(dsu.find(idx)).or_default().push(records[idx].id.clone());
        }
        let mut groups: Vec<Vec<String>> = by_root
            .into_values()
            .map(|mut ids| {
                ids.sort();
                ids
            })
            .collect();
        groups.sort();
        groups
    }

    fn similar(&self, a: &FuzzyKey, b: &FuzzyKey) -> bool {
        if a.title.len() < 5 || b.title.len() < 5 {
            return false;
        }
        if let (Some(ya), Some(yb)) = (&a.year, &b.year) {
            if ya != yb {
                return false;
            }
        }
        if a.title != b.title && strsim::normalized_levenshtein(&a.title, &b.title) < self.title_threshold {
            return false;
        }
        match (&a.author, &b.author) {
            (Some(x), Some(y)) => strsim::jaro_winkler(x, y) >= self.author_threshold,
            _ => a.title == b.title,
        }
    }
}

struct FuzzyKey {
    title: String,
    author: Option<String>,
    year: Option<String>,
}

impl FuzzyKey {
    fn of(record: &Record) -> Self {
        let known = |key: &str| record.value(key).filter(|v| *v != values::UNKNOWN);
        Self {
            title: known(fields::TITLE).map(normalize_text).unwrap_or_default(),
            author: known(fields::AUTHOR)
                .and_then(|a| a.split(" and ").next())
                .map(|first| normalize_text(first.split(',').next().unwrap_or(first)))
                .filter(|a| !a.is_empty()),
            year: known(fields::YEAR).map(str::to_string),
        }
    }
}

/// Lowercase alphanumerics separated by single spaces.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn bucket<F>(records: &[&Record], keys: F) -> BTreeMap<String, Vec<usize>>
where
    F: Fn(&Record) -> Vec<String>,
{
    let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        for key in keys(record) {
            buckets.entry(key).or_default().push(idx);
        }
    }
    buckets
}

fn components(
    records: &[&Record],
    buckets: BTreeMap<String, Vec<usize>>,
    pairs: &[(usize, usize)],
    strategy: DedupStrategy,
) -> Vec<DuplicateGroup> {
    let mut dsu = DisjointSet::new(records.len());
    let mut touched = BTreeSet::new();
    for indexes in buckets.into_values().filter(|i| i.len() > 1) {
        if let Some((first, rest)) = indexes.split_first() {
            touched.insert(*first);
            for idx in rest {
                touched.insert(*idx);
                dsu.union(*first, *idx);
            }
        }
    }
    for (a, b) in pairs {
        touched.insert(*a);
        touched.insert(*b);
        dsu.union(*a, *b);
    }

    let mut by_root: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for idx in touched {
        by_root.entry(dsu.find(idx)).or_default().push(records[idx].id.clone());
    }
    let mut groups: Vec<DuplicateGroup> = by_root
        .into_values()
        .filter(|ids| ids.len() > 1)
        .map(|mut ids| {
            ids.sort();
            DuplicateGroup { ids, strategy }
        })
        .collect();
    groups.sort_by(|a, b| a.ids.cmp(&b.ids));
    groups
}

#[derive(Debug, Clone)]
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, fields: &[(&str, &str)]) -> Record {
        let mut r = Record::new(id, "article");
        for (k, v) in fields {
            r.update_field(k, *v, "test");
        }
        r
    }

    #[test]
    fn doi_blocking_ignores_case_and_resolver() {
        let a = record("A", &[("doi", "10.1234/abc")]);
        let b = record("B", &[("doi", "https://doi.org/10.1234/ABC")]);
        let c = record("C", &[("doi", "10.1234/other")]);
        let groups = DuplicateFinder::new().find_by_doi(&[&a, &b, &c]);
        assert_eq!(groups, vec![DuplicateGroup { ids: vec!["A".into(), "B".into()], strategy: DedupStrategy::Doi }]);
    }

    #[test]
    fn isbn_forms_match() {
        let a = record("A", &[("isbn", "0306406152")]);
        let b = record("B", &[("isbn", "978-0-306-40615-7")]);
        let groups = DuplicateFinder::new().find_by_isbn(&[&a, &b]);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn fuzzy_matching_needs_title_author_and_year() {
        let base = [
            ("title", "Digital Platforms: A Review and Future Directions"),
            ("author", "Smith, Ann and Doe, John"),
            ("year", "2020"),
        ];
        let a = record("A", &base);
        let b = record("B", &[
            ("title", "Digital platforms - a review and future directions"),
            ("author", "Smith, A."),
            ("year", "2020"),
        ]);
        let other_year = record("C", &[
            ("title", "Digital Platforms: A Review and Future Directions"),
            ("author", "Smith, Ann"),
            ("year", "2015"),
        ]);
        let other_author = record("D", &[
            ("title", "Digital Platforms: A Review and Future Directions"),
            ("author", "Zhang, Wei"),
            ("year", "2020"),
        ]);
        let groups = DuplicateFinder::new().find_fuzzy(&[&a, &b, &other_year, &other_author]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn strategies_combine_transitively() {
        let a = record("A", &[("doi", "10.1234/x"), ("title", "Short")]);
        let b = record("B", &[("doi", "10.1234/x"), ("isbn", "0306406152")]);
        let c = record("C", &[("isbn", "9780306406157")]);
        let d = record("D", &[("title", "Unrelated work on something")]);
        let groups = DuplicateFinder::new().find_all(&[&a, &b, &c, &d]);
        assert_eq!(groups, vec![vec!["A".to_string(), "B".to_string(), "C".to_string()]]);
    }
}
