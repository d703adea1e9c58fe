//! The primary quantifier, consumed as an external command.
//!
//! Every sample is serialized to a JSON file holding the per-item classifier
//! outputs and the sample's [`SampleStats`]. The command is invoked with its
//! argument template, `{input}` replaced by that file's path, and must print
//! a single prevalence value on stdout.

use crate::classify_count::SampleStats;
use crate::data::PredictionSet;
use crate::quantifier::{PrevalenceEstimate, Quantifier, QuantifierError};
use crate::rates::RateEstimates;
use crate::sampling::Sample;
use crate::subprocess::{parse_scalar, run_tool, ExternalError, ToolCommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tempfile::TempDir;

/// Placeholder substituted with the input file path
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// How to invoke the primary quantifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryCommand {
    /// Method name reported in result tables
    pub name: String,
    /// Executable (plus fixed leading arguments)
    #[serde(flatten)]
    pub tool: ToolCommand,
    /// Argument template; `{input}` marks the input file
    #[serde(default = "default_args")]
    pub args: String,
    /// Per-sample timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_args() -> String {
    INPUT_PLACEHOLDER.to_string()
}

const fn default_timeout_secs() -> u64 {
    60
}

/// One item as seen by the primary quantifier
#[derive(Debug, Clone, Copy, Serialize)]
struct ItemOutput {
    hard: u8,
    soft: f64,
}

/// File content handed to the command
#[derive(Debug, Serialize)]
struct SamplePayload {
    outputs: Vec<ItemOutput>,
    stats: SampleStats,
}

/// [`Quantifier`] that delegates each sample to an external command
#[derive(Debug, Clone)]
pub struct CommandQuantifier<'a> {
    name: String,
    tool: ToolCommand,
    args: Vec<String>,
    timeout: Duration,
    predictions: &'a PredictionSet,
    rates: RateEstimates,
}

impl<'a> CommandQuantifier<'a> {
    /// Prepare the command; the template is split once, shell style.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for an unbalanced quote in the template.
    pub fn new(
        command: &PrimaryCommand,
        predictions: &'a PredictionSet,
        rates: RateEstimates,
    ) -> Result<Self, ExternalError> {
        let mut args =
            shell_words::split(&command.args).map_err(|e| ExternalError::InvalidArguments {
                template: command.args.clone(),
                reason: e.to_string(),
            })?;
        if !args.iter().any(|a| a.contains(INPUT_PLACEHOLDER)) {
            args.push(INPUT_PLACEHOLDER.to_string());
        }
        Ok(Self {
            name: command.name.clone(),
            tool: command.tool.clone(),
            args,
            timeout: Duration::from_secs(command.timeout_secs),
            predictions,
            rates,
        })
    }

    fn payload(&self, sample: &Sample) -> Result<SamplePayload, QuantifierError> {
        let stats = SampleStats::compute(sample, self.predictions, self.rates)?;
        let hard = self.predictions.hard();
        let soft = self.predictions.soft();
        let outputs = sample
            .ids()
            .iter()
            .map(|&id| ItemOutput {
                hard: hard[id],
                soft: soft[id],
            })
            .collect();
        Ok(SamplePayload { outputs, stats })
    }
}

impl Quantifier for CommandQuantifier<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn quantify(&self, sample: &Sample) -> Result<PrevalenceEstimate, QuantifierError> {
        // ids are validated by SampleStats::compute
        let payload = self.payload(sample)?;
        let dir = TempDir::new().map_err(ExternalError::from)?;
        let input = dir.path().join("sample.json");
        let json = serde_json::to_vec(&payload).map_err(|e| ExternalError::IoError(e.into()))?;
        std::fs::write(&input, json).map_err(ExternalError::from)?;

        let input_arg = input.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(INPUT_PLACEHOLDER, &input_arg))
            .collect();
        let output = run_tool(&self.tool, &args, dir.path(), self.timeout)?;
        let value = parse_scalar(&self.tool.display_name(), &output.stdout)?;
        Ok(PrevalenceEstimate::new(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sampling::{ItemPools, SamplingConfig, SamplingEngine};

    fn predictions() -> PredictionSet {
        let labels: Vec<u8> = (0..40).map(|i| u8::from(i < 20)).collect();
        let soft: Vec<f64> = labels.iter().map(|&y| if y == 1 { 0.9 } else { 0.1 }).collect();
        PredictionSet::from_soft(labels, soft).unwrap()
    }

    fn sample(set: &PredictionSet) -> Sample {
        SamplingEngine::new(
            ItemPools::from_predictions(set),
            SamplingConfig {
                sample_size: 10,
                samples_per_prevalence: 1,
                seed: 5,
            },
        )
        .unwrap()
        .draw(0, 0.3)
        .unwrap()
    }

    fn command(args: &str) -> PrimaryCommand {
        PrimaryCommand {
            name: "qnet".to_string(),
            tool: ToolCommand::new("sh"),
            args: args.to_string(),
            timeout_secs: 10,
        }
    }

    #[test]
    fn test_template_gets_input_appended() {
        let set = predictions();
        let q = CommandQuantifier::new(&command("--model m.bin"), &set, RateEstimates::perfect()).unwrap();
        assert_eq!(q.args, vec!["--model", "m.bin", "{input}"]);
        assert_eq!(q.name(), "qnet");
    }

    #[test]
    fn test_unbalanced_template_rejected() {
        let set = predictions();
        let err = CommandQuantifier::new(&command("--model 'm.bin"), &set, RateEstimates::perfect()).unwrap_err();
        assert!(matches!(err, ExternalError::InvalidArguments { .. }));
    }

    #[test]
    fn test_payload_carries_outputs_and_stats() {
        let set = predictions();
        let q = CommandQuantifier::new(&command("{input}"), &set, RateEstimates::perfect()).unwrap();
        let s = sample(&set);
        let payload = q.payload(&s).unwrap();
        assert_eq!(payload.outputs.len(), 10);
        assert!((payload.stats.cc - 0.3).abs() < 1e-12);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["stats"]["apcc"].is_number());
        assert!(json["outputs"][0]["soft"].is_number());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output_is_estimate() {
        let set = predictions();
        let q = CommandQuantifier::new(&command("-c 'test -s \"$0\" && echo 0.35' {input}"), &set, RateEstimates::perfect())
            .unwrap();
        let estimate = q.quantify(&sample(&set)).unwrap();
        assert!((estimate.prevalence() - 0.35).abs() < 1e-12);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_out_of_range_is_clamped() {
        let set = predictions();
        let q = CommandQuantifier::new(&command("-c 'echo 1.4'"), &set, RateEstimates::perfect()).unwrap();
        let estimate = q.quantify(&sample(&set)).unwrap();
        assert!((estimate.prevalence() - 1.0).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_garbage_output() {
        let set = predictions();
        let q = CommandQuantifier::new(&command("-c 'echo oops'"), &set, RateEstimates::perfect()).unwrap();
        let err = q.quantify(&sample(&set)).unwrap_err();
        assert!(matches!(
            err,
            QuantifierError::External(ExternalError::MalformedOutput { .. })
        ));
    }
}
