//! Task table: classnames and prompt templates per classification task

use crate::tasks::{CUB_200_2011_CLASSNAMES, CUB_200_2011_TEMPLATES};
use crate::{Result, TtaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Placeholder substituted with the classname
pub const CLASSNAME_PLACEHOLDER: &str = "{}";

/// Classnames and prompt templates of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub classnames: Vec<String>,
    /// Prompt patterns containing `{}`
    pub templates: Vec<String>,
}

impl TaskSpec {
    pub fn new(classnames: Vec<String>, templates: Vec<String>) -> Result<Self> {
        let spec = Self {
            classnames,
            templates,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.classnames.is_empty() {
            return Err(TtaError::Configuration("Task has no classnames".into()));
        }
        if self.templates.is_empty() {
            return Err(TtaError::Configuration("Task has no templates".into()));
        }
        if let Some(bad) = self
            .templates
            .iter()
            .find(|t| !t.contains(CLASSNAME_PLACEHOLDER))
        {
            return Err(TtaError::Configuration(format!(
                "Template '{}' has no {} placeholder",
                bad, CLASSNAME_PLACEHOLDER
            )));
        }
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.classnames.len()
    }

    /// Every template rendered for one classname
    pub fn prompts(&self, classname: &str) -> Vec<String> {
        self.templates
            .iter()
            .map(|t| t.replacen(CLASSNAME_PLACEHOLDER, classname, 1))
            .collect()
    }
}

/// Task name to [`TaskSpec`] lookup
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskSpec>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the builtin tasks
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.tasks.insert(
            "cub_200_2011".to_string(),
            TaskSpec {
                classnames: CUB_200_2011_CLASSNAMES.iter().map(|s| s.to_string()).collect(),
                templates: CUB_200_2011_TEMPLATES.iter().map(|s| s.to_string()).collect(),
            },
        );
        registry
    }

    pub fn register(&mut self, task: impl Into<String>, spec: TaskSpec) -> Result<()> {
        spec.validate()?;
        self.tasks.insert(task.into(), spec);
        Ok(())
    }

    pub fn get(&self, task: &str) -> Result<&TaskSpec> {
        self.tasks
            .get(task)
            .ok_or_else(|| TtaError::UnknownTask(task.to_string()))
    }

    pub fn contains(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    /// Register every task of a JSON object `{task: {classnames, templates}}`
    pub fn extend_from_json(&mut self, json: &str) -> Result<usize> {
        let tasks: BTreeMap<String, TaskSpec> = serde_json::from_str(json)?;
        let count = tasks.len();
        for (name, spec) in tasks {
            self.register(name, spec)?;
        }
        Ok(count)
    }

    pub fn load_json(&mut self, path: &Path) -> Result<usize> {
        let json = std::fs::read_to_string(path)?;
        let count = self.extend_from_json(&json)?;
        info!("Loaded {} tasks from {}", count, path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_cub() {
        let registry = TaskRegistry::with_builtin();
        let cub = registry.get("cub_200_2011").unwrap();
        assert_eq!(cub.num_classes(), 200);
        assert_eq!(cub.classnames[0], "Black_footed_Albatross");
        assert_eq!(cub.classnames[199], "Common_Yellowthroat");
        assert_eq!(
            cub.prompts("Cardinal"),
            vec!["a photo of a Cardinal.", "a photo of the Cardinal."]
        );
    }

    #[test]
    fn test_unknown_task() {
        let registry = TaskRegistry::with_builtin();
        assert!(matches!(
            registry.get("imagenet"),
            Err(TtaError::UnknownTask(name)) if name == "imagenet"
        ));
    }

    #[test]
    fn test_extend_from_json() {
        let mut registry = TaskRegistry::new();
        let count = registry
            .extend_from_json(
                r#"{"toy": {"classnames": ["cat", "dog"], "templates": ["a {} photo"]}}"#,
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(registry.task_names(), vec!["toy"]);
        assert_eq!(registry.get("toy").unwrap().prompts("dog"), vec!["a dog photo"]);

        assert!(registry
            .extend_from_json(r#"{"bad": {"classnames": ["x"], "templates": ["no slot"]}}"#)
            .is_err());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{"a": {"classnames": ["x"], "templates": ["{}"]}, "b": {"classnames": ["y"], "templates": ["{}!"]}}"#,
        )
        .unwrap();
        let mut registry = TaskRegistry::with_builtin();
        assert_eq!(registry.load_json(&path).unwrap(), 2);
        assert!(registry.contains("a") && registry.contains("cub_200_2011"));
    }
}
