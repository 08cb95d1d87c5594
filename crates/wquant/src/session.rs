//! Export session: the array and layer registry.
//!
//! A [`Session`] remembers every array name and every layer written during
//! one export pass. Names are unique per session. At the end,
//! [`Session::finish`] emits the declarations that tie arrays to layers:
//!
//! - binary-blob mode: the `<model>_arrays[]` name table, the model struct
//!   and an `init_<model>()` function calling each layer's init function in
//!   registration order
//! - direct mode: one `const` layer literal per layer plus its `extern`
//!   declaration

use std::collections::HashSet;
use std::fmt::Write as _;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use wquant_core::{DType, Error, LayerKind, Result};

use crate::config::WriterConfig;
use crate::sink::WeightSink;

/// One registered array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayEntry {
    pub name: String,
    pub dtype: DType,
    pub len: usize,
}

/// Argument of a layer's init call or struct literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    /// Named array, or `NULL` when absent.
    Array(Option<String>),
    Int(usize),
    /// Bare C identifier such as `ACTIVATION_TANH`.
    Ident(String),
}

impl Arg {
    pub fn array(name: impl Into<String>) -> Self {
        Arg::Array(Some(name.into()))
    }

    /// Array reference that is present only when `present` holds.
    pub fn array_if(present: bool, name: impl Into<String>) -> Self {
        Arg::Array(present.then(|| name.into()))
    }

    fn quoted(&self) -> String {
        match self {
            Arg::Array(Some(name)) => format!("\"{name}\""),
            other => other.bare(),
        }
    }

    fn bare(&self) -> String {
        match self {
            Arg::Array(Some(name)) => name.clone(),
            Arg::Array(None) => "NULL".to_string(),
            Arg::Int(v) => v.to_string(),
            Arg::Ident(s) => s.clone(),
        }
    }
}

/// Everything needed to declare one exported layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub kind: LayerKind,
    /// Struct fields in runtime order.
    pub args: Vec<Arg>,
    pub out_size: usize,
    pub state_size: Option<usize>,
}

impl LayerRecord {
    /// Deferred construction call used in blob mode.
    pub fn init_call(&self) -> String {
        let mut call = format!("{}(&model->{}, arrays", self.kind.init_fn(), self.name);
        for arg in &self.args {
            let _ = write!(call, ", {}", arg.quoted());
        }
        call.push(')');
        call
    }

    /// Constant struct initializer used in direct mode.
    pub fn literal(&self) -> String {
        let fields: Vec<String> = self.args.iter().map(|a| format!("   {}", a.bare())).collect();
        format!(
            "\n\nconst {} {} = {{\n{}\n}};\n\n",
            self.kind.c_type(),
            self.name,
            fields.join(",\n")
        )
    }
}

/// Counts reported by [`Session::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub arrays: usize,
    pub layers: usize,
    /// Payload bytes over all registered arrays.
    pub bytes: usize,
}

/// Registry for one export pass.
#[derive(Debug, Clone)]
pub struct Session {
    model_struct_name: String,
    add_typedef: bool,
    arrays: IndexMap<String, ArrayEntry>,
    layers: IndexMap<String, LayerRecord>,
}

impl Session {
    pub fn new(model_struct_name: impl Into<String>) -> Self {
        Self {
            model_struct_name: model_struct_name.into(),
            add_typedef: false,
            arrays: IndexMap::new(),
            layers: IndexMap::new(),
        }
    }

    /// Session named and styled after a writer configuration.
    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            add_typedef: config.add_typedef,
            ..Self::new(config.model_struct_name.clone())
        }
    }

    pub fn model_struct_name(&self) -> &str {
        &self.model_struct_name
    }

    /// Record an array name. Fails without touching the registry if taken.
    pub fn register_array(&mut self, name: &str, dtype: DType, len: usize) -> Result<()> {
        if self.arrays.contains_key(name) {
            return Err(Error::duplicate_array(name));
        }
        self.arrays.insert(
            name.to_string(),
            ArrayEntry {
                name: name.to_string(),
                dtype,
                len,
            },
        );
        Ok(())
    }

    /// Record a layer. Fails without touching the registry if taken.
    pub fn register_layer(&mut self, record: LayerRecord) -> Result<()> {
        if self.layers.contains_key(&record.name) {
            return Err(Error::duplicate_layer(record.name));
        }
        self.layers.insert(record.name.clone(), record);
        Ok(())
    }

    /// Check that a batch of arrays and layers could all be registered.
    ///
    /// Names must be free in the registry and unique within the batch.
    pub fn check_batch(&self, arrays: &[ArrayEntry], layers: &[LayerRecord]) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in arrays {
            if self.arrays.contains_key(&entry.name) || !seen.insert(entry.name.as_str()) {
                return Err(Error::duplicate_array(entry.name.as_str()));
            }
        }
        seen.clear();
        for record in layers {
            if self.layers.contains_key(&record.name) || !seen.insert(record.name.as_str()) {
                return Err(Error::duplicate_layer(record.name.as_str()));
            }
        }
        Ok(())
    }

    /// Register a batch of arrays and layers, all or nothing.
    pub fn register_batch(&mut self, arrays: Vec<ArrayEntry>, layers: Vec<LayerRecord>) -> Result<()> {
        self.check_batch(&arrays, &layers)?;
        for entry in arrays {
            self.arrays.insert(entry.name.clone(), entry);
        }
        for record in layers {
            self.layers.insert(record.name.clone(), record);
        }
        Ok(())
    }

    pub fn contains_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    pub fn contains_layer(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Registered arrays in registration order.
    pub fn arrays(&self) -> impl Iterator<Item = &ArrayEntry> {
        self.arrays.values()
    }

    /// Registered layers in registration order.
    pub fn layers(&self) -> impl Iterator<Item = &LayerRecord> {
        self.layers.values()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerRecord> {
        self.layers.get(name)
    }

    /// Blob-mode init call of a registered layer.
    pub fn init_call(&self, name: &str) -> Option<String> {
        self.layers.get(name).map(LayerRecord::init_call)
    }

    fn lower_name(&self) -> String {
        self.model_struct_name.to_lowercase()
    }

    fn model_type(&self) -> String {
        if self.add_typedef {
            self.model_struct_name.clone()
        } else {
            format!("struct {}", self.model_struct_name)
        }
    }

    fn array_table(&self) -> String {
        let mut s = format!(
            "\n#ifndef USE_WEIGHTS_FILE\nconst WeightArray {}_arrays[] = {{\n",
            self.lower_name()
        );
        for name in self.arrays.keys() {
            let _ = write!(
                s,
                "#ifdef WEIGHTS_{name}_DEFINED\n    {{\"{name}\",  WEIGHTS_{name}_TYPE, sizeof({name}), {name}}},\n#endif\n"
            );
        }
        s.push_str("    {NULL, 0, 0, NULL}\n};\n#endif /* USE_WEIGHTS_FILE */\n");
        s
    }

    fn init_function(&self) -> String {
        let mut s = format!(
            "\n#ifndef DUMP_BINARY_WEIGHTS\nint init_{}({} *model, const WeightArray *arrays) {{\n",
            self.lower_name(),
            self.model_type()
        );
        for layer in self.layers.values() {
            let _ = writeln!(s, "    if ({}) return 1;", layer.init_call());
        }
        s.push_str("    return 0;\n}\n#endif /* DUMP_BINARY_WEIGHTS */\n");
        s
    }

    fn model_struct(&self) -> String {
        let mut fields = String::new();
        for layer in self.layers.values() {
            let _ = writeln!(fields, "    {} {};", layer.kind.c_type(), layer.name);
        }
        if self.add_typedef {
            format!("\ntypedef struct {{\n{fields}}} {};\n", self.model_struct_name)
        } else {
            format!("\nstruct {} {{\n{fields}}};\n", self.model_struct_name)
        }
    }

    /// Emit the closing declarations and end the session.
    pub fn finish<S: WeightSink + ?Sized>(self, sink: &mut S) -> Result<SessionSummary> {
        if sink.binary_blob() {
            sink.write_source(&self.array_table())?;
            sink.write_source(&self.init_function())?;

            sink.write_header(&self.model_struct())?;
            sink.write_header(&format!(
                "\nint init_{}({} *model, const WeightArray *arrays);\n",
                self.lower_name(),
                self.model_type()
            ))?;
        } else {
            for layer in self.layers.values() {
                sink.write_source(&layer.literal())?;
                sink.write_header(&format!(
                    "\nextern const {} {};\n",
                    layer.kind.c_type(),
                    layer.name
                ))?;
            }
        }

        let summary = SessionSummary {
            arrays: self.arrays.len(),
            layers: self.layers.len(),
            bytes: self.arrays.values().map(|a| a.len * a.dtype.size()).sum(),
        };
        info!(
            model = %self.model_struct_name,
            arrays = summary.arrays,
            layers = summary.layers,
            bytes = summary.bytes,
            binary_blob = sink.binary_blob(),
            "finished export session"
        );
        Ok(summary)
    }
}
