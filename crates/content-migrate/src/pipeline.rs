//! Dependency-ordered migration pipeline.
//!
//! A pipeline is a set of stages, one per content type, each naming the
//! content types it depends on. [`PipelineDefinition::resolve`] turns that
//! graph into the linear order stages execute in: dependencies first, ties
//! broken by declaration order so the same definition always yields the same
//! order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::content::ContentType;
use crate::error::{Error, Result};

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStageDefinition {
    /// Content type migrated by this stage.
    pub content_type: ContentType,
    /// Content types that must be migrated first.
    #[serde(default)]
    pub depends_on: Vec<ContentType>,
}

impl PipelineStageDefinition {
    /// Creates a stage definition.
    pub fn new(content_type: impl Into<ContentType>, depends_on: &[&str]) -> Self {
        Self {
            content_type: content_type.into(),
            depends_on: depends_on.iter().map(|d| ContentType::new(*d)).collect(),
        }
    }
}

/// The full set of stage definitions, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineDefinition {
    stages: Vec<PipelineStageDefinition>,
}

impl PipelineDefinition {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pipeline from stage definitions.
    #[must_use]
    pub fn from_stages(stages: Vec<PipelineStageDefinition>) -> Self {
        Self { stages }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, content_type: impl Into<ContentType>, depends_on: &[&str]) -> Self {
        self.stages
            .push(PipelineStageDefinition::new(content_type, depends_on));
        self
    }

    /// Default server-to-server pipeline.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .stage("Group", &[])
            .stage("User", &["Group"])
            .stage("Project", &["User"])
            .stage("DataSource", &["Project", "User"])
            .stage("Workbook", &["Project", "User", "DataSource"])
    }

    /// Stage definitions in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[PipelineStageDefinition] {
        &self.stages
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if a stage exists for `content_type`.
    #[must_use]
    pub fn contains(&self, content_type: &ContentType) -> bool {
        self.stages.iter().any(|s| &s.content_type == content_type)
    }

    /// Resolves the execution order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStage`], [`Error::MissingDependency`] or
    /// [`Error::CyclicDependency`] when no valid order exists.
    pub fn resolve(&self) -> Result<Vec<ContentType>> {
        let mut index: HashMap<&ContentType, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index.insert(&stage.content_type, i).is_some() {
                return Err(Error::DuplicateStage(stage.content_type.to_string()));
            }
        }

        // Deduplicated dependency indices per stage.
        let mut dependencies: Vec<HashSet<usize>> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut deps = HashSet::new();
            for dep in &stage.depends_on {
                let Some(&dep_index) = index.get(dep) else {
                    return Err(Error::MissingDependency {
                        stage: stage.content_type.to_string(),
                        dependency: dep.to_string(),
                    });
                };
                deps.insert(dep_index);
            }
            dependencies.push(deps);
        }

        let mut remaining: Vec<usize> = dependencies.iter().map(HashSet::len).collect();
        let mut done = vec![false; self.stages.len()];
        let mut order = Vec::with_capacity(self.stages.len());

        while order.len() < self.stages.len() {
            // Earliest declared stage whose dependencies are all done.
            let next = (0..self.stages.len()).find(|&i| !done[i] && remaining[i] == 0);

            let Some(next) = next else {
                let stages = (0..self.stages.len())
                    .filter(|&i| !done[i])
                    .map(|i| self.stages[i].content_type.to_string())
                    .collect();
                return Err(Error::CyclicDependency { stages });
            };

            done[next] = true;
            order.push(self.stages[next].content_type.clone());

            for (i, deps) in dependencies.iter().enumerate() {
                if !done[i] && deps.contains(&next) {
                    remaining[i] -= 1;
                }
            }
        }

        Ok(order)
    }

    /// Human-readable execution plan, for logging.
    ///
    /// # Errors
    ///
    /// Returns the resolution error if the pipeline is invalid.
    pub fn execution_plan(&self) -> Result<String> {
        let order = self.resolve()?;
        Ok(order
            .iter()
            .enumerate()
            .map(|(i, content_type)| format!("Stage {}: {}", i + 1, content_type))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(order: &[ContentType]) -> Vec<&str> {
        order.iter().map(ContentType::as_str).collect()
    }

    #[test]
    fn test_group_before_user() {
        let pipeline = PipelineDefinition::new()
            .stage("User", &["Group"])
            .stage("Group", &[]);

        let order = pipeline.resolve().unwrap();
        assert_eq!(names(&order), vec!["Group", "User"]);
    }

    #[test]
    fn test_standard_pipeline_order() {
        let order = PipelineDefinition::standard().resolve().unwrap();
        assert_eq!(
            names(&order),
            vec!["Group", "User", "Project", "DataSource", "Workbook"]
        );
    }

    #[test]
    fn test_independent_stages_keep_declaration_order() {
        let pipeline = PipelineDefinition::new()
            .stage("C", &[])
            .stage("A", &[])
            .stage("B", &[]);

        assert_eq!(names(&pipeline.resolve().unwrap()), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_tie_break_prefers_earlier_declaration_once_ready() {
        let pipeline = PipelineDefinition::new()
            .stage("Workbook", &["Project"])
            .stage("Project", &[])
            .stage("Schedule", &[]);

        // Workbook becomes ready after Project and is declared before Schedule.
        assert_eq!(
            names(&pipeline.resolve().unwrap()),
            vec!["Project", "Workbook", "Schedule"]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let pipeline = PipelineDefinition::new()
            .stage("Group", &[])
            .stage("A", &["B"])
            .stage("B", &["A"]);

        match pipeline.resolve() {
            Err(Error::CyclicDependency { stages }) => {
                assert_eq!(stages, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let pipeline = PipelineDefinition::new().stage("Project", &["Project"]);
        assert!(matches!(
            pipeline.resolve(),
            Err(Error::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let pipeline = PipelineDefinition::new().stage("User", &["Group"]);
        assert!(matches!(
            pipeline.resolve(),
            Err(Error::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_stage() {
        let pipeline = PipelineDefinition::new()
            .stage("User", &[])
            .stage("User", &[]);
        assert!(matches!(pipeline.resolve(), Err(Error::DuplicateStage(_))));
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let pipeline = PipelineDefinition::new()
            .stage("Group", &[])
            .stage("User", &["Group", "Group"]);
        assert_eq!(names(&pipeline.resolve().unwrap()), vec!["Group", "User"]);
    }

    #[test]
    fn test_execution_plan_string() {
        let plan = PipelineDefinition::standard().execution_plan().unwrap();
        assert!(plan.starts_with("Stage 1: Group"));
        assert!(plan.contains("Stage 5: Workbook"));
    }

    #[test]
    fn test_yaml_stage_list() {
        let yaml = r#"
- content_type: Group
- content_type: User
  depends_on: [Group]
"#;
        let pipeline: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(names(&pipeline.resolve().unwrap()), vec!["Group", "User"]);
    }

    /// Builds an acyclic pipeline: stage `i` may only depend on stages `< i`,
    /// then the declaration order is shuffled by `rotation`.
    fn acyclic_pipeline(edges: &[Vec<bool>], rotation: usize) -> PipelineDefinition {
        let n = edges.len();
        let mut stages: Vec<PipelineStageDefinition> = (0..n)
            .map(|i| PipelineStageDefinition {
                content_type: ContentType::new(format!("T{i}")),
                depends_on: (0..i)
                    .filter(|&j| edges[i][j])
                    .map(|j| ContentType::new(format!("T{j}")))
                    .collect(),
            })
            .collect();
        if n > 0 {
            stages.rotate_left(rotation % n);
        }
        PipelineDefinition::from_stages(stages)
    }

    proptest! {
        #[test]
        fn prop_order_respects_every_edge(
            edges in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 8), 1..8),
            rotation in 0usize..8,
        ) {
            let pipeline = acyclic_pipeline(&edges, rotation);
            let order = pipeline.resolve().unwrap();
            prop_assert_eq!(order.len(), pipeline.stages().len());

            let position: HashMap<&ContentType, usize> =
                order.iter().enumerate().map(|(i, c)| (c, i)).collect();
            for stage in pipeline.stages() {
                for dep in &stage.depends_on {
                    prop_assert!(position[dep] < position[&stage.content_type]);
                }
            }
        }

        #[test]
        fn prop_order_is_deterministic(
            edges in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 8), 1..8),
            rotation in 0usize..8,
        ) {
            let pipeline = acyclic_pipeline(&edges, rotation);
            prop_assert_eq!(pipeline.resolve().unwrap(), pipeline.clone().resolve().unwrap());
        }
    }
}
