//! Stage context - inputs and upstream outputs handed to the agent

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything an agent gets to see for one stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageContext {
    /// Pipeline variables
    pub variables: HashMap<String, String>,

    /// Stage-level inputs (override variables with the same key)
    pub inputs: HashMap<String, String>,

    /// Outputs from completed dependencies (stage name -> output)
    pub upstream_outputs: HashMap<String, String>,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output of a dependency
    pub fn set_upstream_output(&mut self, stage: &str, output: String) {
        self.upstream_outputs.insert(stage.to_string(), output);
    }

    pub fn upstream_output(&self, stage: &str) -> Option<&String> {
        self.upstream_outputs.get(stage)
    }

    /// Flattened variables available for template rendering
    pub fn rendering_variables(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();
        vars.extend(self.inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (stage, output) in &self.upstream_outputs {
            vars.insert(format!("steps.{}.output", stage), output.trim_end().to_string());
        }

        vars
    }

    /// Replace `{{ name }}` placeholders in a template
    pub fn render(&self, template: &str) -> String {
        let mut rendered = template.to_string();

        for (key, value) in self.rendering_variables() {
            let placeholder = format!("{{{{ {} }}}}", key);
            rendered = rendered.replace(&placeholder, &value);
        }

        rendered
    }
}
