/// LCModel `.COORD` output parser
///
/// The file is line oriented; each section is announced by a keyword line:
///
/// ```text
///  N lines in following concentration table = NCONC+1
///  N lines in following misc. output table
///  NY points on ppm-axis = NY
///  NY phased data points follow
///  NY points of the fit to the data follow
///  NY background values follow
///  <name>  Conc. = <value>            (one per metabolite sub-spectrum)
/// ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::command::ExternalToolError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaboliteConcentration {
    pub name: String,
    pub concentration: f64,
    pub sd_percent: f64,
    /// Ratio to the reference metabolite (usually Cr+PCr)
    pub ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub ppm: Vec<f64>,
    pub data: Vec<f64>,
    pub fit: Vec<f64>,
    pub baseline: Vec<f64>,
    /// `data - fit`
    pub residual: Vec<f64>,
    pub metabolites: Vec<MetaboliteConcentration>,
    pub fwhm_ppm: Option<f64>,
    pub snr: Option<f64>,
    pub data_shift_ppm: Option<f64>,
    pub phase0_deg: Option<f64>,
    pub phase1_deg_per_ppm: Option<f64>,
    /// Fitted sub-spectrum of each metabolite
    pub subspectra: BTreeMap<String, Vec<f64>>,
}

impl FitResult {
    pub fn metabolite(&self, name: &str) -> Option<&MetaboliteConcentration> {
        self.metabolites.iter().find(|m| m.name == name)
    }
}

fn parse_error(message: impl Into<String>) -> ExternalToolError {
    ExternalToolError::Parse {
        what: "COORD file".to_string(),
        message: message.into(),
    }
}

fn leading_count(line: &str) -> Result<usize, ExternalToolError> {
    line.split_whitespace()
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| parse_error(format!("no count in '{}'", line.trim())))
}

/// First number after `key` on the line
fn value_after(line: &str, key: &str) -> Option<f64> {
    let start = line.find(key)? + key.len();
    line[start..].split_whitespace().next()?.parse().ok()
}

/// Read `n` whitespace-separated numbers starting at line `start`; returns
/// the values and the index of the first unread line.
fn read_values(
    lines: &[&str],
    start: usize,
    n: usize,
) -> Result<(Vec<f64>, usize), ExternalToolError> {
    let mut values = Vec::with_capacity(n);
    let mut idx = start;
    while values.len() < n {
        let line = lines
            .get(idx)
            .ok_or_else(|| parse_error(format!("expected {} values, found {}", n, values.len())))?;
        for token in line.split_whitespace() {
            let v: f64 = token
                .parse()
                .map_err(|_| parse_error(format!("bad number '{}' on line {}", token, idx + 1)))?;
            values.push(v);
        }
        idx += 1;
    }
    if values.len() != n {
        return Err(parse_error(format!(
            "expected {} values, found {}",
            n,
            values.len()
        )));
    }
    Ok((values, idx))
}

fn parse_concentration(line: &str) -> Option<MetaboliteConcentration> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    Some(MetaboliteConcentration {
        concentration: tokens[0].parse().ok()?,
        sd_percent: tokens[1].strip_suffix('%')?.parse().ok()?,
        ratio: tokens[2].parse().ok()?,
        name: tokens[3..].join(" "),
    })
}

fn parse_misc(line: &str, result: &mut FitResult) {
    if let Some(v) = value_after(line, "FWHM =") {
        result.fwhm_ppm = Some(v);
    }
    if let Some(v) = value_after(line, "S/N =") {
        result.snr = Some(v);
    }
    if let Some(v) = value_after(line, "Data shift =") {
        result.data_shift_ppm = Some(v);
    }
    if let Some(start) = line.find("Ph:") {
        let tokens: Vec<&str> = line[start + 3..].split_whitespace().collect();
        result.phase0_deg = tokens.first().and_then(|t| t.parse().ok());
        if let Some(pos) = tokens.iter().position(|t| *t == "deg/ppm") {
            result.phase1_deg_per_ppm = pos
                .checked_sub(1)
                .and_then(|i| tokens[i].parse().ok());
        }
    }
}

pub fn parse_coord(text: &str) -> Result<FitResult, ExternalToolError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut result = FitResult::default();
    let mut ny: Option<usize> = None;
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        idx += 1;

        if line.contains("lines in following concentration table") {
            let n = leading_count(line)?;
            let end = (idx + n).min(lines.len());
            result
                .metabolites
                .extend(lines[idx..end].iter().filter_map(|l| parse_concentration(l)));
            idx = end;
        } else if line.contains("lines in following misc. output table") {
            let n = leading_count(line)?;
            let end = (idx + n).min(lines.len());
            for l in &lines[idx..end] {
                parse_misc(l, &mut result);
            }
            idx = end;
        } else if line.contains("points on ppm-axis") {
            let n = leading_count(line)?;
            let (values, next) = read_values(&lines, idx, n)?;
            result.ppm = values;
            ny = Some(n);
            idx = next;
        } else if let Some(n) = ny {
            let target = if line.contains("phased data points follow") {
                Some(&mut result.data)
            } else if line.contains("points of the fit to the data follow") {
                Some(&mut result.fit)
            } else if line.contains("background values follow") {
                Some(&mut result.baseline)
            } else {
                None
            };
            if let Some(target) = target {
                let (values, next) = read_values(&lines, idx, n)?;
                *target = values;
                idx = next;
            } else if let Some(pos) = line.find("Conc. =") {
                let name = line[..pos].trim().to_string();
                let (values, next) = read_values(&lines, idx, n)?;
                result.subspectra.insert(name, values);
                idx = next;
            }
        }
    }

    if ny.is_none() {
        return Err(parse_error("no ppm axis section"));
    }
    if result.data.len() == result.fit.len() {
        result.residual = result.data.iter().zip(&result.fit).map(|(d, f)| d - f).collect();
    }
    log::debug!(
        "COORD: {} points, {} metabolites, {} sub-spectra",
        result.ppm.len(),
        result.metabolites.len(),
        result.subspectra.len()
    );
    Ok(result)
}

pub fn read_coord(path: &Path) -> Result<FitResult, ExternalToolError> {
    if !path.is_file() {
        return Err(ExternalToolError::MissingOutput(path.to_path_buf()));
    }
    parse_coord(&fs::read_to_string(path)?)
}
