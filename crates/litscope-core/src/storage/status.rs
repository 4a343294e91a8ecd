use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::record::RecordMap;
use crate::state::RecordState;

/// Summary written to `status.toml` on every commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub total: usize,
    /// Records currently in each state.
    pub currently: BTreeMap<String, usize>,
    /// Records that are in each state or have moved past it.
    pub overall: BTreeMap<String, usize>,
}

impl StatusReport {
    pub fn from_records(records: &RecordMap) -> Self {
        Self::from_states(records.values().map(|r| r.status()))
    }

    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = RecordState>,
    {
        let states: Vec<RecordState> = states.into_iter().collect();
        let mut currently = BTreeMap::new();
        for state in &states {
            *currently.entry(state.to_string()).or_insert(0) += 1;
        }

        let overall = RecordState::ALL
            .iter()
            .map(|state| {
                let post = state.post_states();
                let n = states
                    .iter()
                    .filter(|s| *s == state || post.contains(s))
                    .count();
                (state.to_string(), n)
            })
            .collect();

        Self {
            total: states.len(),
            currently,
            overall,
        }
    }

    pub fn count(&self, state: RecordState) -> usize {
        self.currently.get(state.as_str()).copied().unwrap_or(0)
    }

    /// Lines for the commit report block, in lifecycle order.
    pub fn summary_lines(&self) -> String {
        let mut out = String::new();
        for state in RecordState::ALL {
            let n = self.count(state);
            if n > 0 {
                let _ = writeln!(out, "  {:<30}{n:>6}", state.as_str());
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }
}
