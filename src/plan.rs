use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifacts::WorkflowType;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
    Stuck,
}

impl Default for SubtaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub patterns_from: Vec<String>,
    #[serde(default)]
    pub verification: Verification,
}

/// A phase identifier: plans in the wild carry either a numeric `phase` or
/// a string `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseKey {
    Number(u64),
    Name(String),
}

impl PhaseKey {
    pub fn as_key(&self) -> String {
        match self {
            PhaseKey::Number(n) => n.to_string(),
            PhaseKey::Name(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PhaseKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<PhaseKey>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl PlanPhase {
    /// Normalised identifier, from either representation.
    pub fn key(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(|k| k.as_key())
            .or_else(|| self.phase.map(|n| n.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_sessions: Option<u32>,
}

/// `implementation_plan.json` — the build contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub spec_name: String,
    #[serde(default)]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub total_phases: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_workers: Option<u32>,
    pub phases: Vec<PlanPhase>,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl ImplementationPlan {
    /// Synthetic one-phase, one-subtask plan for the quick-spec path when
    /// the agent emitted only the spec document.
    pub fn minimal(spec_name: &str, workflow_type: WorkflowType, description: &str) -> Self {
        Self {
            spec_name: spec_name.to_string(),
            workflow_type,
            total_phases: 1,
            recommended_workers: Some(1),
            phases: vec![PlanPhase {
                id: Some(PhaseKey::Name("1".to_string())),
                phase: None,
                name: "implement".to_string(),
                description: None,
                depends_on: Vec::new(),
                subtasks: vec![Subtask {
                    id: "1.1".to_string(),
                    description: description.to_string(),
                    service: Some("main".to_string()),
                    status: SubtaskStatus::Pending,
                    files_to_create: Vec::new(),
                    files_to_modify: Vec::new(),
                    patterns_from: Vec::new(),
                    verification: Verification {
                        kind: "manual".to_string(),
                        ..Default::default()
                    },
                }],
            }],
            metadata: PlanMetadata {
                created_at: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    /// Validate the plan: every phase has an identifier, identifiers are
    /// unique, `depends_on` references exist and the dependency graph is
    /// acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::Pipeline("plan has no phases".to_string()));
        }

        let mut keys: Vec<String> = Vec::with_capacity(self.phases.len());
        for (index, phase) in self.phases.iter().enumerate() {
            let key = phase.key().ok_or_else(|| {
                Error::Pipeline(format!(
                    "phase {index} ('{}') has neither 'id' nor 'phase'",
                    phase.name
                ))
            })?;
            if keys.contains(&key) {
                return Err(Error::Pipeline(format!(
                    "duplicate phase identifier '{key}' in plan"
                )));
            }
            keys.push(key);

            if phase.subtasks.is_empty() {
                return Err(Error::Pipeline(format!(
                    "phase '{}' has no subtasks",
                    phase.name
                )));
            }
            let mut subtask_ids = HashSet::new();
            for subtask in &phase.subtasks {
                if !subtask_ids.insert(subtask.id.as_str()) {
                    return Err(Error::Pipeline(format!(
                        "duplicate subtask id '{}' in phase '{}'",
                        subtask.id, phase.name
                    )));
                }
            }
        }

        let key_set: HashSet<&String> = keys.iter().collect();
        for phase in &self.phases {
            for dep in &phase.depends_on {
                let dep_key = dep.as_key();
                if !key_set.contains(&dep_key) {
                    return Err(Error::Pipeline(format!(
                        "phase '{}' depends on unknown phase '{dep_key}'",
                        phase.name
                    )));
                }
            }
        }

        if has_cycle(&self.phases) {
            return Err(Error::Pipeline(
                "plan dependency graph has a cycle".to_string(),
            ));
        }

        Ok(())
    }

    /// Phase keys in a valid execution order (dependencies first).
    pub fn execution_order(&self) -> Result<Vec<String>> {
        self.validate()?;
        Ok(topological_order(&self.phases))
    }

    pub fn pending_subtasks(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|p| &p.subtasks)
            .filter(|s| s.status == SubtaskStatus::Pending || s.status == SubtaskStatus::InProgress)
            .count()
    }
}

/// Kahn's algorithm over the phase graph; unresolved nodes mean a cycle.
fn topological_order(phases: &[PlanPhase]) -> Vec<String> {
    let keys: Vec<String> = phases.iter().filter_map(|p| p.key()).collect();
    let index_of: HashMap<&String, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

    let mut in_degree = vec![0usize; phases.len()];
    let mut successors: HashMap<usize, Vec<usize>> = HashMap::new();

    for (i, phase) in phases.iter().enumerate() {
        for dep in &phase.depends_on {
            if let Some(&from) = index_of.get(&dep.as_key()) {
                successors.entry(from).or_default().push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..phases.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(phases.len());
    while let Some(i) = queue.pop_front() {
        order.push(keys[i].clone());
        if let Some(next) = successors.get(&i) {
            for &j in next {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
    }
    order
}

fn has_cycle(phases: &[PlanPhase]) -> bool {
    topological_order(phases).len() < phases.len()
}

/// Content hash binding a human approval to the exact plan bytes.
pub fn plan_hash(plan_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(id: &str) -> Subtask {
        Subtask {
            id: id.to_string(),
            description: "do a thing".to_string(),
            service: Some("main".to_string()),
            status: SubtaskStatus::Pending,
            files_to_create: vec![],
            files_to_modify: vec![],
            patterns_from: vec![],
            verification: Verification {
                kind: "manual".to_string(),
                ..Default::default()
            },
        }
    }

    fn phase(id: &str, deps: &[&str]) -> PlanPhase {
        PlanPhase {
            id: Some(PhaseKey::Name(id.to_string())),
            phase: None,
            name: format!("phase-{id}"),
            description: None,
            depends_on: deps.iter().map(|d| PhaseKey::Name(d.to_string())).collect(),
            subtasks: vec![subtask(&format!("{id}.1"))],
        }
    }

    fn plan(phases: Vec<PlanPhase>) -> ImplementationPlan {
        ImplementationPlan {
            spec_name: "001-test".to_string(),
            workflow_type: WorkflowType::Feature,
            total_phases: phases.len() as u32,
            recommended_workers: Some(1),
            phases,
            metadata: PlanMetadata::default(),
        }
    }

    #[test]
    fn test_valid_plan_passes() {
        let p = plan(vec![phase("1", &[]), phase("2", &["1"])]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_minimal_plan_is_valid() {
        let p = ImplementationPlan::minimal("003-typo", WorkflowType::Docs, "fix typo");
        p.validate().unwrap();
        assert_eq!(p.phases.len(), 1);
        assert_eq!(p.phases[0].subtasks[0].service.as_deref(), Some("main"));
        assert_eq!(p.phases[0].subtasks[0].verification.kind, "manual");
    }

    #[test]
    fn test_duplicate_phase_key_rejected() {
        let p = plan(vec![phase("1", &[]), phase("1", &[])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate phase identifier"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let p = plan(vec![phase("1", &["99"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("unknown phase"));
    }

    #[test]
    fn test_cycle_rejected() {
        let p = plan(vec![phase("1", &["2"]), phase("2", &["1"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let p = plan(vec![phase("1", &["1"])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_numeric_phase_field_accepted() {
        let json = r#"{
            "spec_name": "002-x",
            "workflow_type": "bugfix",
            "total_phases": 2,
            "phases": [
                {"phase": 1, "name": "a", "depends_on": [],
                 "subtasks": [{"id": "1.1", "description": "d", "status": "pending",
                               "verification": {"type": "manual"}}]},
                {"phase": 2, "name": "b", "depends_on": [1],
                 "subtasks": [{"id": "2.1", "description": "d", "status": "pending",
                               "verification": {"type": "run", "run": "cargo test"}}]}
            ],
            "metadata": {}
        }"#;
        let p: ImplementationPlan = serde_json::from_str(json).unwrap();
        assert!(p.validate().is_ok());
        assert_eq!(p.execution_order().unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_mixed_id_and_phase_fields() {
        let json = r#"{
            "spec_name": "004-x",
            "phases": [
                {"id": "setup", "name": "setup", "depends_on": [],
                 "subtasks": [{"id": "s1", "description": "d", "verification": {"type": "manual"}}]},
                {"phase": 2, "name": "impl", "depends_on": ["setup"],
                 "subtasks": [{"id": "i1", "description": "d", "verification": {"type": "manual"}}]}
            ]
        }"#;
        let p: ImplementationPlan = serde_json::from_str(json).unwrap();
        assert!(p.validate().is_ok());
        assert_eq!(p.execution_order().unwrap(), vec!["setup", "2"]);
    }

    #[test]
    fn test_phase_without_identifier_rejected() {
        let json = r#"{
            "spec_name": "005-x",
            "phases": [
                {"name": "anon", "depends_on": [],
                 "subtasks": [{"id": "a", "description": "d", "verification": {"type": "manual"}}]}
            ]
        }"#;
        let p: ImplementationPlan = serde_json::from_str(json).unwrap();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let p = plan(vec![]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_phase_without_subtasks_rejected() {
        let mut ph = phase("1", &[]);
        ph.subtasks.clear();
        let p = plan(vec![ph]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_duplicate_subtask_id_rejected() {
        let mut ph = phase("1", &[]);
        ph.subtasks.push(subtask("1.1"));
        let p = plan(vec![ph]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate subtask"));
    }

    #[test]
    fn test_execution_order_respects_deps() {
        let p = plan(vec![
            phase("3", &["1", "2"]),
            phase("1", &[]),
            phase("2", &["1"]),
        ]);
        let order = p.execution_order().unwrap();
        let pos = |k: &str| order.iter().position(|x| x == k).unwrap();
        assert!(pos("1") < pos("2"));
        assert!(pos("2") < pos("3"));
    }

    #[test]
    fn test_plan_roundtrips_exactly() {
        let p = plan(vec![phase("1", &[]), phase("2", &["1"])]);
        let json = serde_json::to_string_pretty(&p).unwrap();
        let back: ImplementationPlan = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string_pretty(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_plan_hash_stable_and_sensitive() {
        let a = plan_hash(b"plan-bytes");
        let b = plan_hash(b"plan-bytes");
        let c = plan_hash(b"plan-bytes-changed");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_pending_subtask_count() {
        let mut p = plan(vec![phase("1", &[]), phase("2", &["1"])]);
        assert_eq!(p.pending_subtasks(), 2);
        p.phases[0].subtasks[0].status = SubtaskStatus::Completed;
        assert_eq!(p.pending_subtasks(), 1);
        p.phases[1].subtasks[0].status = SubtaskStatus::Failed;
        assert_eq!(p.pending_subtasks(), 0);
    }
}
