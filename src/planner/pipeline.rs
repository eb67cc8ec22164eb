//! Per-shard command pipelines rendered from stage templates.
//!
//! A stage template is a Tera template. Each shard renders every template
//! with the following variables:
//!
//! - `index`, `start`, `end`: the shard's [`ShardRange`]
//! - `shard_count`, `total_items`: the overall geometry
//! - `output`: the shard's output path
//! - any extra variables registered with [`ShardPlanner::with_var`]
//!
//! The rendered stages of a shard are chained with `&&`, so a stage only
//! runs once its predecessor has exited successfully.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tracing::debug;

use super::range::{shard_ranges, ShardRange};
use crate::error::PlanError;

/// Default per-shard output path template.
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "{{ output_dir }}/shard_{{ index }}";

/// Default output directory when none is configured.
const DEFAULT_OUTPUT_DIR: &str = "/output";

/// An unrendered pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Optional human-readable name, used in logs and plan output.
    #[serde(default)]
    pub name: Option<String>,
    /// Command template.
    pub command: String,
    /// Input path templates this stage reads.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output path templates this stage writes.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl StageTemplate {
    /// Creates a stage template from a command template.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Sets the stage name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares an input path template.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Declares an output path template.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }
}

/// A rendered command belonging to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Stage name, or `stage-{position}` when the template had none.
    pub name: String,
    /// Rendered shell command.
    pub command: String,
    /// Rendered input paths.
    pub inputs: Vec<String>,
    /// Rendered output paths.
    pub outputs: Vec<String>,
}

/// The ordered stages of a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPipeline {
    /// Items this shard processes.
    pub range: ShardRange,
    /// Rendered per-shard output path.
    pub output: String,
    /// Stages in execution order.
    pub stages: Vec<PipelineStage>,
}

impl ShardPipeline {
    /// Renders the pipeline as one shell command, each stage gated on the
    /// success of the one before it.
    ///
    /// Every stage runs in its own subshell with its command on separate
    /// lines, so a trailing `# comment` or `&` in one stage cannot swallow
    /// or detach the stages after it.
    pub fn command_line(&self) -> String {
        self.stages
            .iter()
            .map(|stage| format!("(\n{}\n)", stage.command.trim()))
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// Task name used when the pipeline is submitted.
    pub fn task_name(&self) -> String {
        format!("shard-{}", self.range.index)
    }
}

/// Builds shard pipelines from stage templates.
#[derive(Debug, Clone)]
pub struct ShardPlanner {
    total_items: u64,
    shard_count: u64,
    output_dir: String,
    output_template: String,
    vars: BTreeMap<String, String>,
}

impl ShardPlanner {
    /// Creates a planner for `total_items` split across `shard_count` shards.
    pub fn new(total_items: u64, shard_count: u64) -> Self {
        Self {
            total_items,
            shard_count,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            output_template: DEFAULT_OUTPUT_TEMPLATE.to_string(),
            vars: BTreeMap::new(),
        }
    }

    /// Sets the directory that per-shard outputs are placed under.
    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = dir.into().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the per-shard output path template.
    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = template.into();
        self
    }

    /// Registers an extra template variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Registers several extra template variables.
    pub fn with_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Renders every shard's pipeline.
    ///
    /// Shards are returned in index order, but that order carries no
    /// execution meaning: shards run independently once submitted.
    ///
    /// # Errors
    ///
    /// - `PlanError::InvalidShardConfig` for an impossible shard geometry
    /// - `PlanError::NoStages` / `PlanError::EmptyStage` for bad templates
    /// - `PlanError::OutputTemplate` if the output path template fails to render
    /// - `PlanError::Template` if a stage template fails to render
    pub fn plan(&self, templates: &[StageTemplate]) -> Result<Vec<ShardPipeline>, PlanError> {
        let ranges = shard_ranges(self.total_items, self.shard_count)?;

        if templates.is_empty() {
            return Err(PlanError::NoStages);
        }
        if let Some(stage) = templates.iter().position(|t| t.command.trim().is_empty()) {
            return Err(PlanError::EmptyStage { stage });
        }

        ranges
            .into_iter()
            .map(|range| self.render_shard(range, templates))
            .collect()
    }

    fn render_shard(
        &self,
        range: ShardRange,
        templates: &[StageTemplate],
    ) -> Result<ShardPipeline, PlanError> {
        let mut context = self.base_context(&range);
        let output = render(&self.output_template, &context).map_err(|source| {
            PlanError::OutputTemplate {
                shard: range.index,
                source,
            }
        })?;
        context.insert("output", &output);

        let mut stages = Vec::with_capacity(templates.len());
        for (position, template) in templates.iter().enumerate() {
            let wrap = |source| PlanError::Template {
                shard: range.index,
                stage: position,
                source,
            };
            let command = render(&template.command, &context).map_err(wrap)?;
            let inputs = render_all(&template.inputs, &context).map_err(wrap)?;
            let outputs = render_all(&template.outputs, &context).map_err(wrap)?;

            stages.push(PipelineStage {
                name: template
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("stage-{}", position)),
                command,
                inputs,
                outputs,
            });
        }

        debug!(
            shard = range.index,
            start = range.start,
            end = range.end,
            stages = stages.len(),
            "Rendered shard pipeline"
        );

        Ok(ShardPipeline {
            range,
            output,
            stages,
        })
    }

    fn base_context(&self, range: &ShardRange) -> Context {
        let mut context = Context::new();
        for (key, value) in &self.vars {
            context.insert(key.as_str(), value);
        }
        context.insert("index", &range.index);
        context.insert("start", &range.start);
        context.insert("end", &range.end);
        context.insert("shard_count", &self.shard_count);
        context.insert("total_items", &self.total_items);
        context.insert("output_dir", &self.output_dir);
        context
    }
}

/// Plans `total_items` across `shard_count` shards with default output paths.
pub fn plan(
    total_items: u64,
    shard_count: u64,
    templates: &[StageTemplate],
) -> Result<Vec<ShardPipeline>, PlanError> {
    ShardPlanner::new(total_items, shard_count).plan(templates)
}

fn render(template: &str, context: &Context) -> Result<String, tera::Error> {
    Tera::one_off(template, context, false)
}

fn render_all(templates: &[String], context: &Context) -> Result<Vec<String>, tera::Error> {
    templates.iter().map(|t| render(t, context)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_and_score() -> Vec<StageTemplate> {
        vec![
            StageTemplate::new(
                "python generate.py --start {{ start }} --end {{ end }} --out {{ output }}/gen.jsonl",
            )
            .with_name("generate")
            .with_output("{{ output }}/gen.jsonl"),
            StageTemplate::new("python score.py --in {{ output }}/gen.jsonl --out {{ output }}/scored.jsonl")
                .with_name("score")
                .with_input("{{ output }}/gen.jsonl")
                .with_output("{{ output }}/scored.jsonl"),
        ]
    }

    #[test]
    fn test_plan_renders_each_shard() {
        let pipelines = ShardPlanner::new(1001, 4)
            .with_output_dir("/results/run-1/")
            .plan(&generate_and_score())
            .expect("plan should succeed");

        assert_eq!(pipelines.len(), 4);
        let last = &pipelines[3];
        assert_eq!(last.range.start, 750);
        assert_eq!(last.range.end, 1001);
        assert_eq!(last.output, "/results/run-1/shard_3");
        assert_eq!(
            last.stages[0].command,
            "python generate.py --start 750 --end 1001 --out /results/run-1/shard_3/gen.jsonl"
        );
        assert_eq!(last.stages[1].inputs, vec!["/results/run-1/shard_3/gen.jsonl"]);
        assert_eq!(last.stages[1].name, "score");
    }

    #[test]
    fn test_command_line_chains_stages() {
        let pipelines = plan(4, 2, &generate_and_score()).expect("plan should succeed");
        let line = pipelines[0].command_line();

        assert_eq!(
            line,
            "(\npython generate.py --start 0 --end 2 --out /output/shard_0/gen.jsonl\n) && \
             (\npython score.py --in /output/shard_0/gen.jsonl --out /output/shard_0/scored.jsonl\n)"
        );
        assert_eq!(pipelines[1].task_name(), "shard-1");
    }

    #[test]
    fn test_stage_order_preserved() {
        let templates = vec![
            StageTemplate::new("echo a"),
            StageTemplate::new("echo b"),
            StageTemplate::new("echo c"),
        ];
        let pipelines = plan(3, 1, &templates).expect("plan should succeed");
        let names: Vec<_> = pipelines[0].stages.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["stage-0", "stage-1", "stage-2"]);
        assert_eq!(
            pipelines[0].command_line(),
            "(\necho a\n) && (\necho b\n) && (\necho c\n)"
        );
    }

    #[test]
    fn test_comment_does_not_swallow_later_stages() {
        let templates = vec![
            StageTemplate::new("echo first # generate"),
            StageTemplate::new("sleep 1 &"),
            StageTemplate::new("echo second"),
        ];
        let pipelines = plan(1, 1, &templates).expect("plan should succeed");

        assert_eq!(
            pipelines[0].command_line(),
            "(\necho first # generate\n) && (\nsleep 1 &\n) && (\necho second\n)"
        );
    }

    #[test]
    fn test_extra_vars_and_output_template() {
        let templates = vec![StageTemplate::new(
            "run --model {{ model }} --shard {{ index }}/{{ shard_count }} --out {{ output }}",
        )];
        let pipelines = ShardPlanner::new(10, 2)
            .with_var("model", "olmo-7b")
            .with_output_template("{{ output_dir }}/part-{{ start }}-{{ end }}.jsonl")
            .with_output_dir("/data")
            .plan(&templates)
            .expect("plan should succeed");

        assert_eq!(
            pipelines[1].stages[0].command,
            "run --model olmo-7b --shard 1/2 --out /data/part-5-10.jsonl"
        );
    }

    #[test]
    fn test_invalid_geometry() {
        let err = plan(3, 5, &generate_and_score()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidShardConfig { .. }));

        let err = plan(3, 0, &generate_and_score()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidShardConfig { .. }));
    }

    #[test]
    fn test_missing_stages() {
        assert!(matches!(plan(10, 2, &[]).unwrap_err(), PlanError::NoStages));

        let templates = vec![StageTemplate::new("echo ok"), StageTemplate::new("  ")];
        assert!(matches!(
            plan(10, 2, &templates).unwrap_err(),
            PlanError::EmptyStage { stage: 1 }
        ));
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let templates = vec![StageTemplate::new("echo {{ nope }}")];
        let err = plan(10, 2, &templates).unwrap_err();

        assert!(matches!(err, PlanError::Template { shard: 0, stage: 0, .. }));

        let templates = vec![StageTemplate::new("echo ok"), StageTemplate::new("echo {{ nope }}")];
        let err = plan(10, 2, &templates).unwrap_err();
        assert!(matches!(err, PlanError::Template { shard: 0, stage: 1, .. }));
    }

    #[test]
    fn test_bad_output_template_does_not_blame_a_stage() {
        let err = ShardPlanner::new(10, 2)
            .with_output_template("{{ output_dir }}/{{ missing }}")
            .plan(&[StageTemplate::new("echo ok")])
            .unwrap_err();

        assert!(matches!(err, PlanError::OutputTemplate { shard: 0, .. }));
    }

    #[test]
    fn test_stage_template_yaml() {
        let yaml = r#"
name: generate
command: "python gen.py --start {{ start }}"
outputs: ["{{ output }}/gen.jsonl"]
"#;
        let template: StageTemplate = serde_yaml::from_str(yaml).expect("valid yaml");

        assert_eq!(template.name.as_deref(), Some("generate"));
        assert!(template.inputs.is_empty());
        assert_eq!(template.outputs.len(), 1);
    }
}
