//! Flow graph validation

use std::collections::HashSet;
use std::fmt;

use dialogue_config::{FlowDefinition, GroupDefinition, GroupExit, StageDefinition};

use super::FlowError;

/// One complete route through the flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPath {
    pub groups: Vec<String>,
    pub stages: Vec<String>,
}

impl fmt::Display for FlowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stages.join(" -> "))
    }
}

/// A flow definition that passed validation
#[derive(Debug, Clone)]
pub struct StageFlow {
    definition: FlowDefinition,
    paths: Vec<FlowPath>,
}

impl StageFlow {
    /// Validate a definition.
    ///
    /// Every path from the entry group must be acyclic, visit each stage at
    /// most once and end on the terminal stage. Branches may only inspect
    /// fields declared by a stage that precedes them on every path.
    pub fn build(definition: FlowDefinition) -> Result<Self, FlowError> {
        check_ids(&definition)?;

        let mut walker = Walker {
            flow: &definition,
            groups: Vec::new(),
            stages: Vec::new(),
            reached: HashSet::new(),
            paths: Vec::new(),
        };
        walker.visit(&definition.entry)?;

        if let Some(group) = definition
            .groups
            .iter()
            .find(|g| !walker.reached.contains(g.id.as_str()))
        {
            return Err(FlowError::UnreachableGroup(group.id.clone()));
        }

        let paths = walker.paths;
        tracing::debug!(flow = %definition.name, paths = paths.len(), "Flow validated");
        Ok(Self { definition, paths })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    /// Every route from the entry group to the terminal stage
    pub fn paths(&self) -> &[FlowPath] {
        &self.paths
    }

    pub fn entry_group(&self) -> &str {
        &self.definition.entry
    }

    pub fn terminal(&self) -> &str {
        &self.definition.terminal
    }

    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.definition.stage(id)
    }

    pub fn group(&self, id: &str) -> Option<&GroupDefinition> {
        self.definition.group(id)
    }

    /// Group ending on the terminal stage, used for early closes
    pub(crate) fn terminal_group(&self) -> Option<&GroupDefinition> {
        self.definition.groups.iter().find(|g| {
            matches!(g.exit, GroupExit::End)
                && g.stages.last().map(String::as_str) == Some(self.terminal())
        })
    }

    pub(crate) fn max_turns(&self, stage: &StageDefinition) -> u32 {
        stage.max_turns.unwrap_or(self.definition.default_max_turns)
    }
}

fn check_ids(flow: &FlowDefinition) -> Result<(), FlowError> {
    let mut stage_ids = HashSet::new();
    for stage in &flow.stages {
        if !stage_ids.insert(stage.id.as_str()) {
            return Err(FlowError::Duplicate {
                kind: "stage",
                id: stage.id.clone(),
            });
        }
    }

    let mut group_ids = HashSet::new();
    for group in &flow.groups {
        if !group_ids.insert(group.id.as_str()) {
            return Err(FlowError::Duplicate {
                kind: "group",
                id: group.id.clone(),
            });
        }
        if group.stages.is_empty() {
            return Err(FlowError::EmptyGroup(group.id.clone()));
        }
        if let Some(stage) = group.stages.iter().find(|s| !stage_ids.contains(s.as_str())) {
            return Err(FlowError::UnknownStage {
                group: group.id.clone(),
                stage: stage.clone(),
            });
        }
    }

    if !stage_ids.contains(flow.terminal.as_str()) {
        return Err(FlowError::UnknownTerminal(flow.terminal.clone()));
    }
    if !group_ids.contains(flow.entry.as_str()) {
        return Err(FlowError::UnknownGroup(flow.entry.clone()));
    }
    Ok(())
}

/// Depth-first walk over every path
struct Walker<'a> {
    flow: &'a FlowDefinition,
    groups: Vec<&'a str>,
    stages: Vec<&'a str>,
    reached: HashSet<&'a str>,
    paths: Vec<FlowPath>,
}

impl<'a> Walker<'a> {
    fn visit(&mut self, group_id: &str) -> Result<(), FlowError> {
        let flow = self.flow;
        let group = flow
            .group(group_id)
            .ok_or_else(|| FlowError::UnknownGroup(group_id.to_string()))?;

        if self.groups.contains(&group.id.as_str()) {
            return Err(FlowError::Cycle(group.id.clone()));
        }
        self.reached.insert(group.id.as_str());
        self.groups.push(group.id.as_str());
        let stage_mark = self.stages.len();

        for (index, stage) in group.stages.iter().enumerate() {
            if self.stages.contains(&stage.as_str()) {
                return Err(FlowError::RepeatedStage {
                    stage: stage.clone(),
                    path: self.describe(stage),
                });
            }
            let is_last = index + 1 == group.stages.len();
            if *stage == flow.terminal && !(is_last && matches!(group.exit, GroupExit::End)) {
                return Err(FlowError::TerminalNotLast {
                    stage: stage.clone(),
                    group: group.id.clone(),
                });
            }
            self.stages.push(stage.as_str());
        }

        match &group.exit {
            GroupExit::End => {
                let last = self.stages.last().copied().unwrap_or_default();
                if last != flow.terminal {
                    return Err(FlowError::TerminalMismatch {
                        path: self.describe(""),
                        last: last.to_string(),
                        terminal: flow.terminal.clone(),
                    });
                }
                self.paths.push(FlowPath {
                    groups: self.groups.iter().map(|g| g.to_string()).collect(),
                    stages: self.stages.iter().map(|s| s.to_string()).collect(),
                });
            }
            GroupExit::Next { group: next } => self.visit(next)?,
            GroupExit::Branch(branch) => {
                let declared = flow
                    .stage(&branch.stage)
                    .map_or(false, |s| s.declares(&branch.field));
                if !declared {
                    return Err(FlowError::UndeclaredBranchField {
                        stage: branch.stage.clone(),
                        field: branch.field.clone(),
                    });
                }
                if !self.stages.contains(&branch.stage.as_str()) {
                    return Err(FlowError::BranchStageNotVisited {
                        group: group.id.clone(),
                        stage: branch.stage.clone(),
                    });
                }
                self.visit(&branch.then)?;
                self.visit(&branch.otherwise)?;
            }
        }

        self.stages.truncate(stage_mark);
        self.groups.pop();
        Ok(())
    }

    fn describe(&self, tail: &str) -> String {
        let mut stages: Vec<&str> = self.stages.clone();
        if !tail.is_empty() {
            stages.push(tail);
        }
        stages.join(" -> ")
    }
}
