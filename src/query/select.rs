//! Input selection: participant filtering, unit grouping and cardinality rules

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Query;
use crate::error::DwiprocError;
use crate::index::{EntityIndex, EntityRecord};

/// One (subject, session, run) triplet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessingUnit {
    pub subject: String,
    pub session: Option<String>,
    pub run: Option<u32>,
}

impl ProcessingUnit {
    pub fn new(subject: impl Into<String>, session: Option<&str>, run: Option<u32>) -> Self {
        Self {
            subject: subject.into(),
            session: session.map(str::to_string),
            run,
        }
    }

    pub fn of(record: &EntityRecord) -> Self {
        Self {
            subject: record.subject.clone(),
            session: record.session.clone(),
            run: record.run,
        }
    }

    /// BIDS filename prefix: `sub-XX[_ses-YY][_run-N]`
    pub fn prefix(&self) -> String {
        let mut prefix = format!("sub-{}", self.subject);
        if let Some(session) = &self.session {
            prefix.push_str(&format!("_ses-{session}"));
        }
        if let Some(run) = self.run {
            prefix.push_str(&format!("_run-{run}"));
        }
        prefix
    }

    /// Subject/session directory: `sub-XX[/ses-YY]`
    pub fn dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(session) = &self.session {
            dir.push(format!("ses-{session}"));
        }
        dir
    }

    fn contains(&self, record: &EntityRecord, scope: Scope) -> bool {
        record.subject == self.subject
            && record.session == self.session
            && (scope == Scope::Session || record.run == self.run)
    }
}

impl fmt::Display for ProcessingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

/// Records considered for a unit: same subject/session, or also same run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Unit,
}

/// A named input the stage needs for every unit
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub name: String,
    pub query: Query,
    pub cardinality: Cardinality,
    pub presence: Presence,
    pub scope: Scope,
    /// Sibling extensions that must accompany each matched record
    pub companions: Vec<String>,
}

impl InputRequest {
    pub fn one(name: impl Into<String>, query: Query) -> Self {
        Self {
            name: name.into(),
            query,
            cardinality: Cardinality::One,
            presence: Presence::Required,
            scope: Scope::Session,
            companions: Vec::new(),
        }
    }

    pub fn many(name: impl Into<String>, query: Query) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::one(name, query)
        }
    }

    pub fn optional(mut self) -> Self {
        self.presence = Presence::Optional;
        self
    }

    pub fn required_if(mut self, required: bool) -> Self {
        self.presence = if required {
            Presence::Required
        } else {
            Presence::Optional
        };
        self
    }

    pub fn unit_scoped(mut self) -> Self {
        self.scope = Scope::Unit;
        self
    }

    pub fn with_companions(mut self, exts: &[&str]) -> Self {
        self.companions = exts.iter().map(|e| e.to_string()).collect();
        self
    }
}

/// Records chosen for one unit, keyed by input name
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSelection {
    pub unit: ProcessingUnit,
    inputs: BTreeMap<String, Vec<EntityRecord>>,
}

impl UnitSelection {
    pub fn new(unit: ProcessingUnit) -> Self {
        Self {
            unit,
            inputs: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, records: Vec<EntityRecord>) {
        self.inputs.insert(name.into(), records);
    }

    pub fn one(&self, name: &str) -> Option<&EntityRecord> {
        self.inputs.get(name).and_then(|r| r.first())
    }

    pub fn all(&self, name: &str) -> &[EntityRecord] {
        self.inputs.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Companion of the `pos`-th record of `name`
    pub fn companion(&self, name: &str, ext: &str, pos: usize) -> Option<&EntityRecord> {
        self.inputs.get(&format!("{name}{ext}"))?.get(pos)
    }

    pub fn has(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }
}

/// Why a unit was excluded from planning
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionIssue {
    Missing {
        unit: ProcessingUnit,
        input: String,
    },
    Ambiguous {
        unit: ProcessingUnit,
        input: String,
        matches: Vec<PathBuf>,
    },
}

impl SelectionIssue {
    pub fn unit(&self) -> &ProcessingUnit {
        match self {
            Self::Missing { unit, .. } | Self::Ambiguous { unit, .. } => unit,
        }
    }

    pub fn is_ambiguity(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }

    pub fn to_error(&self) -> DwiprocError {
        match self {
            Self::Missing { unit, input } => DwiprocError::SelectionMissing {
                unit: unit.to_string(),
                input: input.clone(),
            },
            Self::Ambiguous {
                unit,
                input,
                matches,
            } => DwiprocError::SelectionAmbiguity {
                unit: unit.to_string(),
                input: input.clone(),
                count: matches.len(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub units: Vec<UnitSelection>,
    pub issues: Vec<SelectionIssue>,
}

/// Evaluates stage queries over a read-only index
pub struct QueryEngine<'a> {
    index: &'a EntityIndex,
    participant: Option<Query>,
}

impl<'a> QueryEngine<'a> {
    pub fn new(index: &'a EntityIndex) -> Self {
        Self {
            index,
            participant: None,
        }
    }

    pub fn with_participant(mut self, participant: Option<Query>) -> Self {
        self.participant = participant;
        self
    }

    pub fn index(&self) -> &'a EntityIndex {
        self.index
    }

    /// Records passing the participant query
    pub fn candidates(&self) -> Vec<&'a EntityRecord> {
        self.index
            .records()
            .iter()
            .filter(|r| self.participant.as_ref().map_or(true, |q| q.matches(r)))
            .collect()
    }

    /// Records passing the participant query and `query`
    pub fn filter(&self, query: &Query) -> Vec<&'a EntityRecord> {
        self.candidates()
            .into_iter()
            .filter(|r| query.matches(r))
            .collect()
    }

    /// Group primary matches into units and resolve every secondary input
    pub fn select(&self, primary: &InputRequest, secondary: &[InputRequest]) -> Selection {
        let candidates = self.candidates();

        let mut grouped: BTreeMap<ProcessingUnit, Vec<&EntityRecord>> = BTreeMap::new();
        for record in candidates.iter().copied().filter(|r| primary.query.matches(r)) {
            grouped.entry(ProcessingUnit::of(record)).or_default().push(record);
        }
        debug!(units = grouped.len(), input = %primary.name, "grouped primary records");

        let mut selection = Selection::default();
        'units: for (unit, records) in grouped {
            let mut chosen = UnitSelection::new(unit.clone());
            if let Err(issue) = self.place(&mut chosen, primary, records) {
                report(&issue);
                selection.issues.push(issue);
                continue 'units;
            }

            for request in secondary {
                let matches: Vec<&EntityRecord> = candidates
                    .iter()
                    .copied()
                    .filter(|r| unit.contains(r, request.scope) && request.query.matches(r))
                    .collect();
                if let Err(issue) = self.place(&mut chosen, request, matches) {
                    report(&issue);
                    selection.issues.push(issue);
                    continue 'units;
                }
            }
            selection.units.push(chosen);
        }
        selection
    }

    /// Apply the cardinality policy and attach companions
    fn place(
        &self,
        chosen: &mut UnitSelection,
        request: &InputRequest,
        matches: Vec<&EntityRecord>,
    ) -> std::result::Result<(), SelectionIssue> {
        let unit = chosen.unit.clone();
        let missing = |input: String| SelectionIssue::Missing {
            unit: unit.clone(),
            input,
        };

        if matches.is_empty() {
            return match request.presence {
                Presence::Required => Err(missing(request.name.clone())),
                Presence::Optional => Ok(()),
            };
        }
        if request.cardinality == Cardinality::One && matches.len() > 1 {
            return Err(SelectionIssue::Ambiguous {
                unit: unit.clone(),
                input: request.name.clone(),
                matches: matches.iter().map(|r| r.path.clone()).collect(),
            });
        }

        let mut companions: Vec<(String, Vec<EntityRecord>)> = Vec::new();
        for ext in &request.companions {
            let mut found = Vec::with_capacity(matches.len());
            for record in &matches {
                match self.index.companion(record, ext) {
                    Some(companion) => found.push(companion.clone()),
                    None if request.presence == Presence::Optional => {
                        debug!(input = %request.name, ext = %ext, "optional input lacks companion");
                        return Ok(());
                    }
                    None => return Err(missing(format!("{}{ext}", request.name))),
                }
            }
            companions.push((format!("{}{ext}", request.name), found));
        }

        chosen.insert(
            request.name.clone(),
            matches.into_iter().cloned().collect(),
        );
        for (name, records) in companions {
            chosen.insert(name, records);
        }
        Ok(())
    }
}

fn report(issue: &SelectionIssue) {
    match issue {
        SelectionIssue::Missing { unit, input } => {
            warn!(unit = %unit, input = %input, "No matching record - skipping unit");
        }
        SelectionIssue::Ambiguous {
            unit,
            input,
            matches,
        } => {
            let paths: Vec<_> = matches.iter().map(|p| display(p)).collect();
            warn!(unit = %unit, input = %input, matches = ?paths, "Ambiguous selection - excluding unit");
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
