//! Record lifecycle: states, stage triggers and the process-order check.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LitscopeError, PreconditionViolation, Result};

/// How far a record has progressed. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    MdRetrieved,
    MdImported,
    MdNeedsManualPreparation,
    MdPrepared,
    MdProcessed,
    RevPrescreenExcluded,
    RevPrescreenIncluded,
    PdfNeedsManualRetrieval,
    PdfImported,
    PdfNotAvailable,
    PdfNeedsManualPreparation,
    PdfPrepared,
    RevExcluded,
    RevIncluded,
    RevSynthesized,
}

impl RecordState {
    pub const ALL: [RecordState; 15] = [
        Self::MdRetrieved,
        Self::MdImported,
        Self::MdNeedsManualPreparation,
        Self::MdPrepared,
        Self::MdProcessed,
        Self::RevPrescreenExcluded,
        Self::RevPrescreenIncluded,
        Self::PdfNeedsManualRetrieval,
        Self::PdfImported,
        Self::PdfNotAvailable,
        Self::PdfNeedsManualPreparation,
        Self::PdfPrepared,
        Self::RevExcluded,
        Self::RevIncluded,
        Self::RevSynthesized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MdRetrieved => "md_retrieved",
            Self::MdImported => "md_imported",
            Self::MdNeedsManualPreparation => "md_needs_manual_preparation",
            Self::MdPrepared => "md_prepared",
            Self::MdProcessed => "md_processed",
            Self::RevPrescreenExcluded => "rev_prescreen_excluded",
            Self::RevPrescreenIncluded => "rev_prescreen_included",
            Self::PdfNeedsManualRetrieval => "pdf_needs_manual_retrieval",
            Self::PdfImported => "pdf_imported",
            Self::PdfNotAvailable => "pdf_not_available",
            Self::PdfNeedsManualPreparation => "pdf_needs_manual_preparation",
            Self::PdfPrepared => "pdf_prepared",
            Self::RevExcluded => "rev_excluded",
            Self::RevIncluded => "rev_included",
            Self::RevSynthesized => "rev_synthesized",
        }
    }

    /// States waiting for manual work on a side branch of the DAG.
    pub fn is_manual_branch(&self) -> bool {
        matches!(
            self,
            Self::MdNeedsManualPreparation
                | Self::PdfNeedsManualRetrieval
                | Self::PdfNeedsManualPreparation
        )
    }

    /// Terminal states: nothing can trigger a transition out of them.
    pub fn is_terminal(&self) -> bool {
        TRANSITIONS.iter().all(|t| t.source != *self)
    }

    /// States reachable by exactly one transition.
    pub fn next_states(&self) -> Vec<RecordState> {
        TRANSITIONS
            .iter()
            .filter(|t| t.source == *self)
            .map(|t| t.dest)
            .collect()
    }

    /// Stages that may be triggered on a record in this state.
    pub fn valid_triggers(&self) -> Vec<Stage> {
        let mut triggers: Vec<Stage> = TRANSITIONS
            .iter()
            .filter(|t| t.source == *self)
            .map(|t| t.trigger)
            .collect();
        triggers.dedup();
        triggers
    }

    /// Every state from which this one can be reached, excluding itself.
    pub fn preceding_states(&self) -> BTreeSet<RecordState> {
        let mut preceding = BTreeSet::new();
        let mut frontier = vec![*self];
        while let Some(state) = frontier.pop() {
            for t in TRANSITIONS.iter().filter(|t| t.dest == state) {
                if preceding.insert(t.source) {
                    frontier.push(t.source);
                }
            }
        }
        preceding.remove(self);
        preceding
    }

    /// This state and every state reachable from it.
    pub fn post_states(&self) -> BTreeSet<RecordState> {
        let mut post = BTreeSet::from([*self]);
        let mut frontier = vec![*self];
        while let Some(state) = frontier.pop() {
            for t in TRANSITIONS.iter().filter(|t| t.source == state) {
                if post.insert(t.dest) {
                    frontier.push(t.dest);
                }
            }
        }
        post
    }

    pub fn is_reachable(&self, to: RecordState) -> bool {
        self.post_states().contains(&to)
    }

    /// Whether one transition leads from this state to `to`.
    pub fn has_edge(&self, to: RecordState) -> bool {
        TRANSITIONS.iter().any(|t| t.source == *self && t.dest == to)
    }

    /// The shortest chain of transitions to `to`, without this state.
    pub fn path_to(&self, to: RecordState) -> Option<Vec<RecordState>> {
        let mut previous: BTreeMap<RecordState, RecordState> = BTreeMap::new();
        let mut queue = VecDeque::from([*self]);
        while let Some(state) = queue.pop_front() {
            if state == to {
                let mut path = Vec::new();
                let mut cursor = to;
                while cursor != *self {
                    path.push(cursor);
                    cursor = *previous.get(&cursor)?;
                }
                path.reverse();
                return Some(path);
            }
            for t in TRANSITIONS.iter().filter(|t| t.source == state) {
                if t.dest != *self && !previous.contains_key(&t.dest) {
                    previous.insert(t.dest, state);
                    queue.push_back(t.dest);
                }
            }
        }
        None
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = LitscopeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s.trim())
            .ok_or_else(|| LitscopeError::RecordNotParsable(format!("unknown status '{s}'")))
    }
}

/// A named pipeline step. Every stage except `Search` triggers transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Load,
    Prep,
    PrepMan,
    Dedupe,
    Prescreen,
    PdfGet,
    PdfGetMan,
    PdfPrep,
    PdfPrepMan,
    Screen,
    Data,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Self::Search,
        Self::Load,
        Self::Prep,
        Self::PrepMan,
        Self::Dedupe,
        Self::Prescreen,
        Self::PdfGet,
        Self::PdfGetMan,
        Self::PdfPrep,
        Self::PdfPrepMan,
        Self::Screen,
        Self::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Load => "load",
            Self::Prep => "prep",
            Self::PrepMan => "prep_man",
            Self::Dedupe => "dedupe",
            Self::Prescreen => "prescreen",
            Self::PdfGet => "pdf_get",
            Self::PdfGetMan => "pdf_get_man",
            Self::PdfPrep => "pdf_prep",
            Self::PdfPrepMan => "pdf_prep_man",
            Self::Screen => "screen",
            Self::Data => "data",
        }
    }

    /// Title used in commit messages ("Load", "Pdf get", ...).
    pub fn title(&self) -> String {
        let words = self.as_str().replace('_', " ");
        let mut chars = words.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// The state records must be in for this stage to act on them.
    pub fn start_state(&self) -> Option<RecordState> {
        TRANSITIONS
            .iter()
            .find(|t| t.trigger == *self)
            .map(|t| t.source)
    }

    pub fn source_states(&self) -> BTreeSet<RecordState> {
        TRANSITIONS
            .iter()
            .filter(|t| t.trigger == *self)
            .map(|t| t.source)
            .collect()
    }

    pub fn target_states(&self) -> BTreeSet<RecordState> {
        TRANSITIONS
            .iter()
            .filter(|t| t.trigger == *self)
            .map(|t| t.dest)
            .collect()
    }

    /// Whether the stage acts on records (and therefore needs some).
    pub fn requires_records(&self) -> bool {
        !matches!(self, Self::Search | Self::Load)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = LitscopeError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| LitscopeError::ConfigError(format!("unknown stage '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub trigger: Stage,
    pub source: RecordState,
    pub dest: RecordState,
}

const fn t(trigger: Stage, source: RecordState, dest: RecordState) -> Transition {
    Transition {
        trigger,
        source,
        dest,
    }
}

pub const TRANSITIONS: &[Transition] = &[
    t(Stage::Load, RecordState::MdRetrieved, RecordState::MdImported),
    t(Stage::Prep, RecordState::MdImported, RecordState::MdNeedsManualPreparation),
    t(Stage::Prep, RecordState::MdImported, RecordState::MdPrepared),
    t(Stage::PrepMan, RecordState::MdNeedsManualPreparation, RecordState::MdPrepared),
    t(Stage::Dedupe, RecordState::MdPrepared, RecordState::MdProcessed),
    t(Stage::Prescreen, RecordState::MdProcessed, RecordState::RevPrescreenExcluded),
    t(Stage::Prescreen, RecordState::MdProcessed, RecordState::RevPrescreenIncluded),
    t(Stage::PdfGet, RecordState::RevPrescreenIncluded, RecordState::PdfImported),
    t(Stage::PdfGet, RecordState::RevPrescreenIncluded, RecordState::PdfNeedsManualRetrieval),
    t(Stage::PdfGetMan, RecordState::PdfNeedsManualRetrieval, RecordState::PdfNotAvailable),
    t(Stage::PdfGetMan, RecordState::PdfNeedsManualRetrieval, RecordState::PdfImported),
    t(Stage::PdfPrep, RecordState::PdfImported, RecordState::PdfNeedsManualPreparation),
    t(Stage::PdfPrep, RecordState::PdfImported, RecordState::PdfPrepared),
    t(Stage::PdfPrepMan, RecordState::PdfNeedsManualPreparation, RecordState::PdfPrepared),
    t(Stage::Screen, RecordState::PdfPrepared, RecordState::RevExcluded),
    t(Stage::Screen, RecordState::PdfPrepared, RecordState::RevIncluded),
    t(Stage::Data, RecordState::RevIncluded, RecordState::RevSynthesized),
];

/// Edges a record passes when PDFs are not required for screen and
/// synthesis: it leaves pdf_get as if imported and prepared.
pub const PDF_NOT_REQUIRED: [RecordState; 2] = [RecordState::PdfImported, RecordState::PdfPrepared];

/// Whether a sequence of statuses (e.g. one record across history) is a path
/// through the lifecycle. Repeated states are allowed.
pub fn state_path_is_valid(path: &[RecordState]) -> bool {
    path.windows(2).all(|pair| pair[0].is_reachable(pair[1]))
}

/// Checks that no record sits in a state strictly before the stage's start
/// state. With `allow_parallel`, records on manual side branches are admitted.
pub fn check_process_order<I>(stage: Stage, current: I, allow_parallel: bool) -> Result<()>
where
    I: IntoIterator<Item = RecordState>,
{
    let current: BTreeSet<RecordState> = current.into_iter().collect();
    if current.is_empty() && stage.requires_records() {
        return Err(LitscopeError::NoRecords);
    }
    let Some(start) = stage.start_state() else {
        return Ok(());
    };

    let mut required_absent = start.preceding_states();
    if allow_parallel {
        required_absent.retain(|s| !s.is_manual_branch());
    }

    let blocking: Vec<RecordState> = current.intersection(&required_absent).copied().collect();
    if blocking.is_empty() {
        Ok(())
    } else {
        Err(PreconditionViolation::ProcessOrder {
            stage,
            blocking_states: blocking,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preceding_states_of_md_processed() {
        let preceding = RecordState::MdProcessed.preceding_states();
        assert_eq!(
            preceding,
            BTreeSet::from([
                RecordState::MdRetrieved,
                RecordState::MdImported,
                RecordState::MdNeedsManualPreparation,
                RecordState::MdPrepared,
            ])
        );
    }

    #[test]
    fn terminal_states_have_no_triggers() {
        for state in [
            RecordState::RevPrescreenExcluded,
            RecordState::PdfNotAvailable,
            RecordState::RevExcluded,
            RecordState::RevSynthesized,
        ] {
            assert!(state.is_terminal(), "{state}");
            assert!(state.valid_triggers().is_empty());
        }
        assert_eq!(RecordState::MdImported.valid_triggers(), vec![Stage::Prep]);
    }

    #[test]
    fn prescreen_blocked_by_unloaded_record() {
        let err = check_process_order(Stage::Prescreen, [RecordState::MdRetrieved], false)
            .unwrap_err();
        match err {
            LitscopeError::PreconditionViolation(PreconditionViolation::ProcessOrder {
                stage,
                blocking_states,
            }) => {
                assert_eq!(stage, Stage::Prescreen);
                assert_eq!(blocking_states, vec![RecordState::MdRetrieved]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn later_states_do_not_block() {
        let states = [
            RecordState::MdProcessed,
            RecordState::RevPrescreenExcluded,
            RecordState::RevIncluded,
        ];
        assert!(check_process_order(Stage::Prescreen, states, false).is_ok());
    }

    #[test]
    fn parallel_stages_admit_manual_branches() {
        let states = [RecordState::MdProcessed, RecordState::MdNeedsManualPreparation];
        assert!(check_process_order(Stage::Prescreen, states, false).is_err());
        assert!(check_process_order(Stage::Prescreen, states, true).is_ok());
    }

    #[test]
    fn empty_project_only_allows_load() {
        assert!(check_process_order(Stage::Load, [], false).is_ok());
        assert!(matches!(
            check_process_order(Stage::Prep, [], false),
            Err(LitscopeError::NoRecords)
        ));
    }

    #[test]
    fn paths_follow_single_edges() {
        assert!(RecordState::MdProcessed.has_edge(RecordState::RevPrescreenIncluded));
        assert!(!RecordState::MdImported.has_edge(RecordState::MdProcessed));
        assert_eq!(
            RecordState::MdImported.path_to(RecordState::RevPrescreenExcluded),
            Some(vec![
                RecordState::MdPrepared,
                RecordState::MdProcessed,
                RecordState::RevPrescreenExcluded,
            ])
        );
        assert_eq!(RecordState::PdfPrepared.path_to(RecordState::PdfPrepared), Some(vec![]));
        assert_eq!(RecordState::RevIncluded.path_to(RecordState::MdImported), None);
        assert!(RecordState::RevPrescreenIncluded.has_edge(PDF_NOT_REQUIRED[0]));
        assert!(PDF_NOT_REQUIRED[0].has_edge(PDF_NOT_REQUIRED[1]));
    }

    #[test]
    fn reachability_and_paths() {
        assert!(RecordState::MdImported.is_reachable(RecordState::RevSynthesized));
        assert!(!RecordState::RevExcluded.is_reachable(RecordState::RevIncluded));
        assert!(state_path_is_valid(&[
            RecordState::MdImported,
            RecordState::MdImported,
            RecordState::MdPrepared,
            RecordState::MdProcessed,
        ]));
        assert!(!state_path_is_valid(&[
            RecordState::MdProcessed,
            RecordState::MdImported,
        ]));
    }

    #[test]
    fn stage_parsing_accepts_cli_names() {
        assert_eq!("pdf-get".parse::<Stage>().unwrap(), Stage::PdfGet);
        assert_eq!("prep_man".parse::<Stage>().unwrap(), Stage::PrepMan);
        assert_eq!(Stage::PdfGet.title(), "Pdf get");
        assert!("unknown".parse::<Stage>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RecordState::RevPrescreenIncluded).unwrap();
        assert_eq!(json, "\"rev_prescreen_included\"");
        assert_eq!(
            "pdf_needs_manual_retrieval".parse::<RecordState>().unwrap(),
            RecordState::PdfNeedsManualRetrieval
        );
    }
}
