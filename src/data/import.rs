/// Loading of scanner data into the normalised in-memory form
///
/// Vendor parsers live behind the [`MrsLoader`] trait; the crate ships a
/// JSON interchange loader so that converted data (and test fixtures) can be
/// fed straight into a pipeline.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::spectrum::{Spectrum, SpectrumError};
use super::transients::{CsiGrid, Transients};

#[derive(Error, Debug)]
pub enum InputLoadError {
    #[error("No input files found")]
    NoFiles,
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("No header could be recovered from {0}")]
    MissingHeader(PathBuf),
    #[error("Inconsistent input: {0}")]
    Inconsistent(String),
    #[error("Invalid spectrum in {path}: {source}")]
    Spectrum {
        path: PathBuf,
        #[source]
        source: SpectrumError,
    },
}

/// Acquisition header, normalised across vendors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub te_ms: Option<f64>,
    pub tr_ms: Option<f64>,
    pub f0_mhz: Option<f64>,
    pub dwell_s: Option<f64>,
    /// CSI matrix size; absent for single-voxel data
    pub matrix_size: Option<[usize; 3]>,
    pub averages_per_repetition: Option<usize>,
    pub sequence: Option<String>,
    pub nucleus: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// What a loader hands back for one file
#[derive(Debug, Clone)]
pub struct LoadedData {
    pub data: Transients,
    pub header: Header,
    pub format: String,
    pub vendor: String,
}

/// Black-box "load MRS file" collaborator
pub trait MrsLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedData, InputLoadError>;

    /// Whether this loader claims the file
    fn accepts(&self, path: &Path) -> bool;
}

/// On-disk layout read by [`JsonLoader`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDataset {
    #[serde(default)]
    pub vendor: String,
    pub header: Option<Header>,
    pub spectra: Vec<Spectrum>,
}

/// Reads the JSON interchange format
#[derive(Debug, Clone, Default)]
pub struct JsonLoader;

impl MrsLoader for JsonLoader {
    fn load(&self, path: &Path) -> Result<LoadedData, InputLoadError> {
        let text = fs::read_to_string(path).map_err(|source| InputLoadError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let dataset: JsonDataset =
            serde_json::from_str(&text).map_err(|e| InputLoadError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let header = dataset
            .header
            .ok_or_else(|| InputLoadError::MissingHeader(path.to_path_buf()))?;

        if dataset.spectra.is_empty() {
            return Err(InputLoadError::Inconsistent(format!(
                "{} contains no spectra",
                path.display()
            )));
        }
        for s in &dataset.spectra {
            s.validate().map_err(|source| InputLoadError::Spectrum {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let data = match header.matrix_size {
            Some(dims) => Transients::Csi(CsiGrid::new(dims, dataset.spectra).map_err(
                |source| InputLoadError::Spectrum {
                    path: path.to_path_buf(),
                    source,
                },
            )?),
            None => Transients::Svs(dataset.spectra),
        };

        Ok(LoadedData {
            data,
            header,
            format: "json".to_string(),
            vendor: if dataset.vendor.is_empty() {
                "unknown".to_string()
            } else {
                dataset.vendor
            },
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

/// Write transients in the JSON interchange format
pub fn write_json(path: &Path, data: &Transients, header: &Header) -> std::io::Result<()> {
    let mut header = header.clone();
    if let Transients::Csi(grid) = data {
        header.matrix_size = Some(grid.dims());
    }
    let dataset = JsonDataset {
        vendor: "mrs_pipeline".to_string(),
        header: Some(header),
        spectra: data.spectra().to_vec(),
    };
    let json = serde_json::to_string_pretty(&dataset)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)
}

/// Loaded, validated inputs for one pipeline run
#[derive(Debug, Clone)]
pub struct InputSet {
    pub data: Transients,
    pub wref: Option<Transients>,
    pub header: Header,
    pub vendor: String,
    pub sources: Vec<PathBuf>,
}

/// Expand directories into the files the loader accepts, sorted
pub fn list_input_files(loader: &dyn MrsLoader, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for p in paths {
        if p.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(p)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| e.path())
                        .filter(|f| f.is_file() && loader.accepts(f))
                        .collect()
                })
                .unwrap_or_default();
            found.sort();
            files.extend(found);
        } else if p.is_file() {
            files.push(p.clone());
        }
    }
    files
}

/// Load every input file (repetitions are concatenated) plus an optional
/// water reference.
pub fn load_inputs(
    loader: &dyn MrsLoader,
    paths: &[PathBuf],
    wref: Option<&Path>,
) -> Result<InputSet, InputLoadError> {
    let files = list_input_files(loader, paths);
    if files.is_empty() {
        return Err(InputLoadError::NoFiles);
    }

    let mut header: Option<Header> = None;
    let mut vendor = String::new();
    let mut repetitions: Vec<Spectrum> = Vec::new();
    let mut grid: Option<CsiGrid> = None;

    for file in &files {
        log::info!("Loading {}", file.display());
        let loaded = loader.load(file)?;
        if header.is_none() {
            header = Some(loaded.header.clone());
            vendor = loaded.vendor.clone();
        }
        match loaded.data {
            Transients::Svs(list) => {
                if grid.is_some() {
                    return Err(InputLoadError::Inconsistent(
                        "cannot mix CSI and single-voxel files".to_string(),
                    ));
                }
                repetitions.extend(list);
            }
            Transients::Csi(g) => {
                if grid.is_some() || !repetitions.is_empty() {
                    return Err(InputLoadError::Inconsistent(
                        "a CSI run takes exactly one file".to_string(),
                    ));
                }
                grid = Some(g);
            }
        }
    }

    let data = match grid {
        Some(g) => Transients::Csi(g),
        None => Transients::Svs(repetitions),
    };
    check_uniform_length(&data)?;

    let wref = match wref {
        Some(path) => {
            let loaded = loader.load(path)?;
            if loaded.data.is_csi() != data.is_csi() {
                log::warn!(
                    "Water reference {} has a different shape family than the data",
                    path.display()
                );
            }
            Some(loaded.data)
        }
        None => None,
    };

    let header = header.ok_or_else(|| InputLoadError::MissingHeader(files[0].clone()))?;
    log::info!("Loaded {} ({} file(s))", data.describe(), files.len());

    Ok(InputSet {
        data,
        wref,
        header,
        vendor,
        sources: files,
    })
}

fn check_uniform_length(data: &Transients) -> Result<(), InputLoadError> {
    let expected = data.first().map(|s| s.samples().len()).unwrap_or(0);
    if let Some(bad) = data.spectra().iter().find(|s| s.samples().len() != expected) {
        return Err(InputLoadError::Inconsistent(format!(
            "sample count {} differs from {}",
            bad.samples().len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::spectrum::tests::synthetic_fid;

    fn write_dataset(dir: &Path, name: &str, spectra: Vec<Spectrum>, header: Option<Header>) -> PathBuf {
        let path = dir.join(name);
        let dataset = JsonDataset {
            vendor: "test".to_string(),
            header,
            spectra,
        };
        fs::write(&path, serde_json::to_string(&dataset).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_load_directory_concatenates_repetitions() {
        let dir = tempfile::tempdir().unwrap();
        let header = Header {
            te_ms: Some(30.0),
            ..Default::default()
        };
        write_dataset(dir.path(), "a.json", vec![synthetic_fid(32, 0.001, 0.0, 0.1); 2], Some(header.clone()));
        write_dataset(dir.path(), "b.json", vec![synthetic_fid(32, 0.001, 1.0, 0.1); 3], Some(header));
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let inputs = load_inputs(&JsonLoader, &[dir.path().to_path_buf()], None).unwrap();
        assert_eq!(inputs.data.len(), 5);
        assert_eq!(inputs.sources.len(), 2);
        assert_eq!(inputs.header.te_ms, Some(30.0));
        assert_eq!(inputs.vendor, "test");
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_inputs(&JsonLoader, &[dir.path().to_path_buf()], None),
            Err(InputLoadError::NoFiles)
        ));
    }

    #[test]
    fn test_missing_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dataset(dir.path(), "a.json", vec![synthetic_fid(32, 0.001, 0.0, 0.1)], None);
        assert!(matches!(
            JsonLoader.load(&path),
            Err(InputLoadError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_matrix_size_builds_grid() {
        let dir = tempfile::tempdir().unwrap();
        let header = Header {
            matrix_size: Some([2, 1, 1]),
            ..Default::default()
        };
        let path = write_dataset(dir.path(), "csi.json", vec![synthetic_fid(16, 0.001, 0.0, 0.1); 2], Some(header));
        let loaded = JsonLoader.load(&path).unwrap();
        assert!(loaded.data.is_csi());
    }

    #[test]
    fn test_write_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = Transients::Svs(vec![synthetic_fid(16, 0.001, 2.0, 0.1)]);
        let path = dir.path().join("out.json");
        write_json(&path, &data, &Header::default()).unwrap();
        let loaded = JsonLoader.load(&path).unwrap();
        assert_eq!(loaded.data, data);
    }
}
