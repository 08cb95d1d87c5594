//! Core type definitions shared by the encoder and the serializer.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Step of the implicit Q7 convention used by the recurrent paths.
pub const Q7_STEP: f32 = 1.0 / 128.0;

/// Activation applied by the runtime after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Tanh,
    Sigmoid,
    Linear,
    Swish,
    Relu,
    Softmax,
}

impl Activation {
    /// All recognized activations.
    pub const ALL: [Activation; 6] = [
        Activation::Tanh,
        Activation::Sigmoid,
        Activation::Linear,
        Activation::Swish,
        Activation::Relu,
        Activation::Softmax,
    ];

    /// Tag as written in configuration and generated code.
    pub fn tag(self) -> &'static str {
        match self {
            Activation::Tanh => "TANH",
            Activation::Sigmoid => "SIGMOID",
            Activation::Linear => "LINEAR",
            Activation::Swish => "SWISH",
            Activation::Relu => "RELU",
            Activation::Softmax => "SOFTMAX",
        }
    }

    /// Runtime constant name, e.g. `ACTIVATION_TANH`.
    pub fn c_name(self) -> String {
        format!("ACTIVATION_{}", self.tag())
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Activation::ALL
            .into_iter()
            .find(|a| a.tag() == s)
            .ok_or_else(|| Error::InvalidActivation(s.to_string()))
    }
}

impl TryFrom<String> for Activation {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Activation> for String {
    fn from(value: Activation) -> Self {
        value.tag().to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Element type of an emitted array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float,
    Int8,
    Int,
    /// Packed quantized weights for the dot-product kernels.
    QWeight,
}

impl DType {
    /// Suffix of the runtime's `WEIGHT_TYPE_*` constant.
    pub fn tag(self) -> &'static str {
        match self {
            DType::Float => "float",
            DType::Int8 => "int8",
            DType::Int => "int",
            DType::QWeight => "qweight",
        }
    }

    /// C element type.
    pub fn c_type(self) -> &'static str {
        match self {
            DType::Float => "float",
            DType::Int8 => "opus_int8",
            DType::Int => "int",
            DType::QWeight => "qweight",
        }
    }

    /// Numeric type code stored in blob records.
    pub fn code(self) -> i32 {
        match self {
            DType::Float => 0,
            DType::Int => 1,
            DType::QWeight => 2,
            DType::Int8 => 3,
        }
    }

    /// Inverse of [`DType::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DType::Float),
            1 => Some(DType::Int),
            2 => Some(DType::QWeight),
            3 => Some(DType::Int8),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Float | DType::Int => 4,
            DType::Int8 | DType::QWeight => 1,
        }
    }
}

/// Layout convention of incoming tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerFormat {
    /// Rows are output channels (the training framework's layout).
    #[default]
    #[serde(alias = "torch")]
    Training,
    /// Already in the runtime's layout; no transposition or gate reorder.
    Runtime,
}

/// Layer record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Dense,
    Conv1d,
    Gru,
    Linear,
}

impl LayerKind {
    /// Runtime struct type name.
    pub fn c_type(self) -> &'static str {
        match self {
            LayerKind::Dense => "DenseLayer",
            LayerKind::Conv1d => "Conv1DLayer",
            LayerKind::Gru => "GRULayer",
            LayerKind::Linear => "LinearLayer",
        }
    }

    /// Runtime function that binds named arrays into the layer struct.
    pub fn init_fn(self) -> &'static str {
        match self {
            LayerKind::Dense => "dense_init",
            LayerKind::Conv1d => "conv1d_init",
            LayerKind::Gru => "gru_init",
            LayerKind::Linear => "linear_init",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_type())
    }
}

/// Quantization step.
///
/// A uniform scale applies to every output channel; a per-channel scale has
/// one entry per output column. There is no implicit default: callers that
/// want the recurrent Q7 convention ask for it with [`Scale::q7`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scale {
    Uniform(f32),
    PerChannel(Vec<f32>),
}

impl Scale {
    /// The 1/128 step.
    pub fn q7() -> Self {
        Scale::Uniform(Q7_STEP)
    }

    /// Step for output channel `channel`.
    #[inline]
    pub fn at(&self, channel: usize) -> f32 {
        match self {
            Scale::Uniform(s) => *s,
            Scale::PerChannel(v) => v[channel],
        }
    }

    /// Check the scale against the number of output channels.
    pub fn validate(&self, nb_outputs: usize) -> Result<()> {
        match self {
            Scale::Uniform(s) if *s > 0.0 && s.is_finite() => Ok(()),
            Scale::Uniform(s) => Err(Error::Config(format!("scale must be positive, got {s}"))),
            Scale::PerChannel(v) if v.len() != nb_outputs => Err(Error::shape(
                "Scale::validate",
                format!("{nb_outputs} per-channel scales"),
                &[v.len()],
            )),
            Scale::PerChannel(v) => match v.iter().find(|s| !(**s > 0.0 && s.is_finite())) {
                Some(s) => Err(Error::Config(format!("scale must be positive, got {s}"))),
                None => Ok(()),
            },
        }
    }

    /// Scale expanded to one value per output channel.
    pub fn per_channel(&self, nb_outputs: usize) -> Vec<f32> {
        (0..nb_outputs).map(|c| self.at(c)).collect()
    }
}
