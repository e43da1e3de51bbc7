//! Named parameter traversal and state-dict loading.
//!
//! Modules expose their tensors through [`Module::visit_params`] under dotted names
//! (`"block.weight"`). State dicts are built from and loaded into those names; per-prefix version
//! metadata lets a module migrate entries saved by an older layout before the tensors are copied.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::spec::DType;
use crate::tensor::Tensor;

pub type VisitParamsFn<'a> = dyn FnMut(&str, TensorRole, &Tensor) -> Result<()> + 'a;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TensorRole {
    Parameter,
    Buffer,
}

/// Hands each named tensor of a module to a callback, keyed under a fixed prefix.
pub struct ParamVisitor<'a> {
    prefix: &'a str,
    f: &'a mut VisitParamsFn<'a>,
}

impl<'a> ParamVisitor<'a> {
    pub fn new(f: &'a mut VisitParamsFn<'a>) -> Self {
        Self::with_prefix("", f)
    }

    /// `prefix` is prepended verbatim, so it carries its own trailing `.`.
    pub fn with_prefix(prefix: &'a str, f: &'a mut VisitParamsFn<'a>) -> Self {
        Self { prefix, f }
    }

    pub fn param(&mut self, leaf: &str, role: TensorRole, tensor: &Tensor) -> Result<()> {
        ensure!(!leaf.is_empty(), "parameter names must be non-empty");
        ensure!(
            !leaf.contains('.'),
            "parameter names must not contain '.', got '{leaf}'"
        );
        let key = format!("{}{leaf}", self.prefix);
        (self.f)(&key, role, tensor)
    }
}

/// Named tensors plus the module version recorded for each prefix.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
    versions: BTreeMap<String, u32>,
}

#[derive(Serialize, Deserialize)]
struct TensorRecord {
    dtype: DType,
    sizes: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct StateDictRecord {
    tensors: BTreeMap<String, TensorRecord>,
    #[serde(default)]
    versions: BTreeMap<String, u32>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Version stored for the module at `prefix` (`""` for the root module).
    pub fn version(&self, prefix: &str) -> Option<u32> {
        self.versions.get(prefix).copied()
    }

    pub fn set_version(&mut self, prefix: impl Into<String>, version: u32) {
        self.versions.insert(prefix.into(), version);
    }

    /// Drops all version metadata, as found in dicts written by older releases.
    pub fn clear_versions(&mut self) {
        self.versions.clear();
    }

    pub fn to_json(&self) -> Result<String> {
        let record = StateDictRecord {
            tensors: self
                .tensors
                .iter()
                .map(|(key, tensor)| {
                    (
                        key.clone(),
                        TensorRecord {
                            dtype: tensor.dtype(),
                            sizes: tensor.sizes().to_vec(),
                            data: tensor.to_vec_f64(),
                        },
                    )
                })
                .collect(),
            versions: self.versions.clone(),
        };
        Ok(serde_json::to_string_pretty(&record)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: StateDictRecord = serde_json::from_str(json)?;
        let mut tensors = BTreeMap::new();
        for (key, entry) in record.tensors {
            let tensor = Tensor::from_vec(entry.sizes, entry.data, entry.dtype)
                .with_context(|| format!("state dict entry '{key}'"))?;
            tensors.insert(key, tensor);
        }
        Ok(Self {
            tensors,
            versions: record.versions,
        })
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write state dict to {}", path.display()))
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read state dict from {}", path.display()))?;
        Self::from_json(&json)
    }
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
    pub error_msgs: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty() && self.error_msgs.is_empty()
    }
}

/// Copies every visited tensor of `module` from `state[prefix + name]`.
///
/// Absent entries are recorded as missing and shape mismatches as error messages; neither
/// stops the remaining tensors from loading.
pub fn load_tensors<M: Module + ?Sized>(
    module: &M,
    state: &StateDict,
    prefix: &str,
    report: &mut LoadReport,
) -> Result<()> {
    let mut copy = |key: &str, _role: TensorRole, tensor: &Tensor| -> Result<()> {
        match state.get(key) {
            Some(src) if src.sizes() == tensor.sizes() => tensor.copy_from(src)?,
            Some(src) => report.error_msgs.push(format!(
                "size mismatch for {key}: copying a param with shape {:?} from checkpoint, \
                 the shape in current model is {:?}.",
                src.sizes(),
                tensor.sizes()
            )),
            None => report.missing_keys.push(key.to_string()),
        }
        Ok(())
    };
    module.visit_params(&mut ParamVisitor::with_prefix(prefix, &mut copy))
}

fn param_names<M: Module + ?Sized>(module: &M) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut collect = |name: &str, _role: TensorRole, _tensor: &Tensor| -> Result<()> {
        names.insert(name.to_string());
        Ok(())
    };
    module.visit_params(&mut ParamVisitor::new(&mut collect))?;
    Ok(names)
}

pub trait Module {
    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()>;

    /// Layout version written into state dicts; `None` writes no metadata.
    fn version(&self) -> Option<u32> {
        None
    }

    /// Snapshot of every visited tensor. Entries share storage with the module.
    fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        let mut insert = |name: &str, _role: TensorRole, tensor: &Tensor| -> Result<()> {
            state.insert(name, tensor.clone());
            Ok(())
        };
        self.visit_params(&mut ParamVisitor::new(&mut insert))?;
        if let Some(version) = self.version() {
            state.set_version("", version);
        }
        Ok(state)
    }

    /// Loads this module's entries under `prefix`. Overrides may rewrite `state` first.
    fn load_from_state_dict(
        &mut self,
        state: &mut StateDict,
        prefix: &str,
        report: &mut LoadReport,
    ) -> Result<()> {
        load_tensors(&*self, state, prefix, report)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<LoadReport> {
        let mut state = state.clone();
        let mut report = LoadReport::default();
        self.load_from_state_dict(&mut state, "", &mut report)?;
        let expected = param_names(&*self)?;
        report.unexpected_keys = state
            .keys()
            .filter(|key| !expected.contains(*key))
            .map(str::to_string)
            .collect();
        Ok(report)
    }

    /// Like [`Module::load_state_dict`], but any missing key, unexpected key or error message
    /// fails the load.
    fn load_state_dict_strict(&mut self, state: &StateDict) -> Result<()> {
        let report = self.load_state_dict(state)?;
        if !report.is_clean() {
            let mut problems = Vec::new();
            if !report.missing_keys.is_empty() {
                problems.push(format!("missing keys: {:?}", report.missing_keys));
            }
            if !report.unexpected_keys.is_empty() {
                problems.push(format!("unexpected keys: {:?}", report.unexpected_keys));
            }
            problems.extend(report.error_msgs);
            bail!("error loading state dict:\n\t{}", problems.join("\n\t"));
        }
        Ok(())
    }
}
