use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::Value as Json;

use crate::utils::NonEmptyVec;

use super::embedded_json;

/// A self-hosted workflow: a graph of steps, each issuing one presentation request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeWorkflow {
    pub id: String,
    pub initial_step: String,
    #[serde(default)]
    pub steps: StepBranches,
}

/// One unit of interaction within a native workflow.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub create_challenge: bool,
    #[serde(
        default,
        deserialize_with = "embedded_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub verifiable_presentation_request: Option<Json>,
    /// Replaces the constraints of every derived input descriptor.
    #[serde(
        default,
        deserialize_with = "embedded_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub constraints_override: Option<Json>,
    /// Branch continuations, evaluated in declared order once this step is verified.
    #[serde(default, skip_serializing_if = "StepBranches::is_empty")]
    pub steps: StepBranches,
    /// Condition under which this step is selected when it appears as a branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<BranchCondition>,
}

/// A presentation-exchange style constraint over the verified presentation.
///
/// Satisfied when any value found at any of the `path` expressions validates against `filter`
/// (or simply exists, when there is no filter).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchCondition {
    pub path: NonEmptyVec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Json>,
}

/// Steps keyed by name, in the order they were declared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepBranches(Vec<(String, Step)>);

impl StepBranches {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Step)> {
        self.0.iter().map(|(name, step)| (name.as_str(), step))
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

impl FromIterator<(String, Step)> for StepBranches {
    fn from_iter<I: IntoIterator<Item = (String, Step)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for StepBranches {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, step) in &self.0 {
            map.serialize_entry(name, step)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StepBranches {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedSteps;

        impl<'de> Visitor<'de> for OrderedSteps {
            type Value = StepBranches;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of step names to steps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut steps: Vec<(String, Step)> = Vec::new();
                while let Some((name, step)) = access.next_entry::<String, Step>()? {
                    if steps.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(format!("duplicate step `{name}`")));
                    }
                    steps.push((name, step));
                }
                Ok(StepBranches(steps))
            }
        }

        deserializer.deserialize_map(OrderedSteps)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("workflow must have at least 1 step")]
    NoSteps,
    #[error("initial step `{0}` is not defined")]
    UnknownInitialStep(String),
    #[error("step `{0}` is defined more than once")]
    DuplicateStep(String),
    #[error("step `{0}` can be revisited; workflows must not contain cycles")]
    Cycle(String),
}

/// An edge of the [StepGraph].
#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    pub target: String,
    pub when: Option<BranchCondition>,
}

/// A step as a node of the [StepGraph]: its own settings plus outgoing edges.
#[derive(Clone, Debug, PartialEq)]
pub struct StepNode {
    pub create_challenge: bool,
    pub verifiable_presentation_request: Option<Json>,
    pub constraints_override: Option<Json>,
    pub branches: Vec<Branch>,
}

/// A native workflow flattened into a graph of step identifiers.
///
/// Nested steps naming a top-level step are edges to it; any other nested step is an inline
/// definition and becomes a node of its own.
#[derive(Clone, Debug)]
pub struct StepGraph {
    initial: String,
    nodes: BTreeMap<String, StepNode>,
}

impl StepGraph {
    pub fn build(workflow: &NativeWorkflow) -> Result<Self, ConfigError> {
        if workflow.steps.is_empty() {
            return Err(ConfigError::NoSteps);
        }

        let top_level: BTreeSet<&str> = workflow.steps.iter().map(|(name, _)| name).collect();
        let mut nodes = BTreeMap::new();
        let mut pending: Vec<(String, &Step)> = workflow
            .steps
            .iter()
            .map(|(name, step)| (name.to_owned(), step))
            .collect();

        while let Some((name, step)) = pending.pop() {
            let mut branches = Vec::new();
            for (target, nested) in step.steps.iter() {
                if !top_level.contains(target) {
                    if nodes.contains_key(target) || pending.iter().any(|(n, _)| n == target) {
                        return Err(ConfigError::DuplicateStep(target.to_owned()));
                    }
                    pending.push((target.to_owned(), nested));
                }
                branches.push(Branch {
                    target: target.to_owned(),
                    when: nested.when.clone(),
                });
            }
            nodes.insert(
                name,
                StepNode {
                    create_challenge: step.create_challenge,
                    verifiable_presentation_request: step.verifiable_presentation_request.clone(),
                    constraints_override: step.constraints_override.clone(),
                    branches,
                },
            );
        }

        if !nodes.contains_key(&workflow.initial_step) {
            return Err(ConfigError::UnknownInitialStep(
                workflow.initial_step.clone(),
            ));
        }

        let graph = Self {
            initial: workflow.initial_step.clone(),
            nodes,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn step(&self, name: &str) -> Option<&StepNode> {
        self.nodes.get(name)
    }

    /// Steps that cannot be reached from the initial step.
    pub fn unreachable(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![self.initial.as_str()];
        while let Some(name) = queue.pop() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                queue.extend(node.branches.iter().map(|b| b.target.as_str()));
            }
        }
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(|name| !seen.contains(name))
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a StepGraph,
            name: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), ConfigError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(ConfigError::Cycle(name.to_owned())),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(node) = graph.nodes.get(name) {
                for branch in &node.branches {
                    visit(graph, &branch.target, marks)?;
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for name in self.nodes.keys() {
            visit(self, name, &mut marks)?;
        }
        Ok(())
    }
}
