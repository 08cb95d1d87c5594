//! Writer and per-layer export configuration.

use serde::{Deserialize, Serialize};
use wquant_core::{Activation, Error, LayerFormat, Result, Scale};

/// Configuration of one export run's generated C code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Name of the model struct listing every layer (blob mode).
    pub model_struct_name: String,
    /// Runtime header declaring the layer structs and init functions.
    pub nnet_header: String,
    /// Reference arrays by name for loading from a weight blob.
    pub binary_blob: bool,
    /// Emit the model struct as an anonymous `typedef struct`.
    pub add_typedef: bool,
    /// Optional banner placed at the top of both files.
    pub message: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            model_struct_name: "Model".to_string(),
            nnet_header: "nnet.h".to_string(),
            binary_blob: true,
            add_typedef: false,
            message: None,
        }
    }
}

impl WriterConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }
}

/// How one layer is exported.
///
/// Each layer type reads the subset of fields it understands; see
/// [`LayerConfig::linear`], [`LayerConfig::gru`] and
/// [`LayerConfig::split_gru`]. Every field but `scale` may be omitted from
/// JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub format: LayerFormat,
    /// Block-sparse input weights.
    #[serde(default)]
    pub sparse: bool,
    /// Block-sparse recurrent weights (split GRU only).
    #[serde(default)]
    pub recurrent_sparse: bool,
    /// Store recurrent self-loops as a separate float diagonal (sparse only).
    #[serde(default)]
    pub diagonal: bool,
    /// Emit int8 weights with bias correction.
    #[serde(default = "default_quantize")]
    pub quantize: bool,
    pub scale: Scale,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    /// GRU applies the reset gate after the recurrent product.
    #[serde(default)]
    pub reset_after: bool,
    /// Emit packed `qweight` tables for the dot-product kernels (fused GRU).
    #[serde(default)]
    pub dot_product: bool,
}

fn default_quantize() -> bool {
    true
}

fn default_activation() -> Activation {
    Activation::Linear
}

impl LayerConfig {
    /// Quantized, dense, linear activation, training layout.
    pub fn new(scale: Scale) -> Self {
        Self {
            format: LayerFormat::Training,
            sparse: false,
            recurrent_sparse: false,
            diagonal: false,
            quantize: default_quantize(),
            scale,
            activation: default_activation(),
            reset_after: false,
            dot_product: false,
        }
    }

    /// Parse from JSON. `scale` is required.
    ///
    /// An unknown activation tag fails with [`Error::InvalidActivation`];
    /// every other malformed input is an [`Error::Config`].
    pub fn from_json(json: &str) -> Result<Self> {
        let mut value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        let activation = match value.as_object_mut().and_then(|o| o.remove("activation")) {
            Some(serde_json::Value::String(tag)) => Some(tag.parse::<Activation>()?),
            Some(other) => {
                return Err(Error::Config(format!("activation must be a tag string, got {other}")))
            }
            None => None,
        };
        let mut config: Self =
            serde_json::from_value(value).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(activation) = activation {
            config.activation = activation;
        }
        Ok(config)
    }

    /// Options for a linear layer.
    pub fn linear(&self) -> LinearOptions {
        LinearOptions {
            format: self.format,
            sparse: self.sparse,
            diagonal: self.diagonal,
            quantize: self.quantize,
            scale: self.scale.clone(),
        }
    }

    /// Options for a fused GRU layer.
    pub fn gru(&self) -> GruOptions {
        GruOptions {
            activation: self.activation,
            format: self.format,
            input_sparse: self.sparse,
            dot_product: self.dot_product,
            reset_after: self.reset_after,
            scale: self.scale.clone(),
        }
    }

    /// Options for a GRU exported as two linear layers.
    pub fn split_gru(&self) -> SplitGruOptions {
        SplitGruOptions {
            format: self.format,
            quantize: self.quantize,
            input_sparse: self.sparse,
            recurrent_sparse: self.recurrent_sparse,
            scale: self.scale.clone(),
        }
    }
}

/// Options for [`crate::write_linear_layer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearOptions {
    pub format: LayerFormat,
    pub sparse: bool,
    pub diagonal: bool,
    pub quantize: bool,
    pub scale: Scale,
}

impl LinearOptions {
    /// Dense, quantized, training layout.
    pub fn new(scale: Scale) -> Self {
        Self {
            format: LayerFormat::Training,
            sparse: false,
            diagonal: false,
            quantize: true,
            scale,
        }
    }
}

/// Options for [`crate::write_gru_layer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruOptions {
    pub activation: Activation,
    pub format: LayerFormat,
    pub input_sparse: bool,
    pub dot_product: bool,
    pub reset_after: bool,
    pub scale: Scale,
}

impl GruOptions {
    /// Dense input weights at the Q7 step.
    pub fn new(activation: Activation) -> Self {
        Self {
            activation,
            format: LayerFormat::Training,
            input_sparse: false,
            dot_product: false,
            reset_after: false,
            scale: Scale::q7(),
        }
    }
}

/// Options for [`crate::write_split_gru_layer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitGruOptions {
    pub format: LayerFormat,
    pub quantize: bool,
    pub input_sparse: bool,
    pub recurrent_sparse: bool,
    pub scale: Scale,
}

impl Default for SplitGruOptions {
    fn default() -> Self {
        Self {
            format: LayerFormat::Training,
            quantize: false,
            input_sparse: false,
            recurrent_sparse: false,
            scale: Scale::q7(),
        }
    }
}
