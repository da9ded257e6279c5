/// Subprocess plugin steps
///
/// A plugin is any executable that reads one JSON request on stdin and
/// writes one JSON response on stdout:
///
/// ```text
/// request:  { "kind", "parameters", "input", "wref", "header" }
/// response: { "output", "wref_output"?, "warnings"? }
/// ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::import::Header;
use crate::data::transients::Transients;
use crate::pipeline::command::{ExternalCommand, ExternalToolError};

use super::parameter::{ParameterSet, ParameterValue};
use super::{DataBag, Step, StepError, StepKind, StepOutcome};

/// Registration entry for a plugin (from the run configuration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Declared parameters and their defaults
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

#[derive(Serialize)]
struct PluginRequest<'a> {
    kind: &'a str,
    parameters: BTreeMap<&'a str, &'a ParameterValue>,
    input: &'a Transients,
    wref: Option<&'a Transients>,
    header: &'a Header,
}

#[derive(Deserialize)]
struct PluginResponse {
    output: Transients,
    #[serde(default)]
    wref_output: Option<Transients>,
    #[serde(default)]
    warnings: Vec<String>,
}

pub struct ExternalStep {
    spec: PluginSpec,
    params: ParameterSet,
}

impl ExternalStep {
    pub fn new(spec: PluginSpec) -> Self {
        let params = spec
            .parameters
            .iter()
            .fold(ParameterSet::new(), |set, (name, default)| match default {
                ParameterValue::Integer(v) => set.integer(name, name, *v, i64::MIN, i64::MAX),
                ParameterValue::Float(v) => set.float(name, name, *v, f64::NEG_INFINITY, f64::INFINITY),
                ParameterValue::Text(v) => set.text(name, name, v),
                ParameterValue::Vector(v) => set.vector(name, name, v, f64::NEG_INFINITY, f64::INFINITY),
            });
        Self { spec, params }
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }
}

impl Step for ExternalStep {
    fn kind(&self) -> StepKind {
        StepKind::External(self.spec.kind.clone())
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        let request = PluginRequest {
            kind: &self.spec.kind,
            parameters: self.params.iter().map(|p| (p.idname.as_str(), p.value())).collect(),
            input: &data.input,
            wref: data.wref.as_ref(),
            header: &data.header,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| ExternalToolError::Parse {
            what: "plugin request".to_string(),
            message: e.to_string(),
        })?;

        let result = ExternalCommand::new(&self.spec.command)
            .args(&self.spec.args)
            .describe(&self.spec.kind)
            .execute_piped(Some(&payload))?
            .check(&self.spec.command)?;

        let response: PluginResponse =
            serde_json::from_str(&result.stdout).map_err(|e| ExternalToolError::Parse {
                what: format!("{} response", self.spec.kind),
                message: e.to_string(),
            })?;

        if response.output.is_csi() != data.input.is_csi() {
            return Err(StepError::Invalid(format!(
                "plugin {} changed the data shape family",
                self.spec.kind
            )));
        }

        let mut outcome = StepOutcome::ok();
        for w in response.warnings {
            outcome.warn(format!("{}: {}", self.spec.kind, w));
        }
        data.output = Some(response.output);
        data.wref_output = response.wref_output;
        Ok(outcome)
    }
}
