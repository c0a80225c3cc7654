//! Training configuration: per-category overrides, defaults, and effective resolution.
//!
//! Every override field is optional. The effective value of a field is the
//! override when present, otherwise the documented default. Device-dependent
//! defaults are resolved against the detected device; resolution is a pure
//! function and never mutates the overrides.

use crate::job::DeviceKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_EPOCHS: u32 = 3;
pub const DEFAULT_BATCH_SIZE_CUDA: u32 = 4;
pub const DEFAULT_BATCH_SIZE_CPU: u32 = 1;
pub const DEFAULT_GRADIENT_ACCUMULATION: u32 = 4;
pub const DEFAULT_LEARNING_RATE_CUDA: f64 = 2e-4;
pub const DEFAULT_LEARNING_RATE_CPU: f64 = 3e-4;
pub const DEFAULT_WARMUP_RATIO_CUDA: f64 = 0.1;
pub const DEFAULT_WARMUP_RATIO_CPU: f64 = 0.03;
pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_OPTIM_CUDA: &str = "paged_adamw_8bit";
pub const DEFAULT_OPTIM_CPU: &str = "adamw_torch";
pub const DEFAULT_WEIGHT_DECAY: f64 = 0.01;
pub const DEFAULT_MAX_GRAD_NORM: f64 = 1.0;
pub const DEFAULT_LR_SCHEDULER_TYPE: &str = "linear";
pub const DEFAULT_NEFTUNE_NOISE_ALPHA: f64 = 0.0;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_LOGGING_STEPS_CUDA: u32 = 10;
pub const DEFAULT_LOGGING_STEPS_CPU: u32 = 5;
pub const DEFAULT_SAVE_STRATEGY: &str = "epoch";

pub const DEFAULT_LORA_R: u32 = 32;
pub const DEFAULT_LORA_ALPHA: u32 = 64;
pub const DEFAULT_LORA_DROPOUT: f64 = 0.05;
pub const DEFAULT_LORA_TARGET_MODULES: [&str; 7] =
    ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"];
pub const DEFAULT_LORA_BIAS: &str = "none";

pub const DEFAULT_BNB_4BIT_QUANT_TYPE: &str = "nf4";
pub const DEFAULT_BNB_4BIT_COMPUTE_DTYPE: &str = "float16";
pub const DEFAULT_OUTPUT_QUANTIZATION: &str = "q8_0";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_STOP: &str = "### Question:";
pub const DEFAULT_SYSTEM: &str = "You are a helpful assistant.";
pub const DEFAULT_REPEAT_PENALTY: f64 = 1.1;
pub const DEFAULT_REPEAT_LAST_N: u32 = 64;
pub const DEFAULT_NUM_CTX: u32 = 2048;

/// Name of the per-project configuration file.
pub const PROJECT_FILE: &str = "project.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOverrides {
    pub num_train_epochs: Option<u32>,
    pub per_device_train_batch_size: Option<u32>,
    pub gradient_accumulation_steps: Option<u32>,
    pub learning_rate: Option<f64>,
    pub warmup_ratio: Option<f64>,
    pub max_length: Option<usize>,
    pub fp16: Option<bool>,
    pub bf16: Option<bool>,
    pub optim: Option<String>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub lr_scheduler_type: Option<String>,
    pub neftune_noise_alpha: Option<f64>,
    pub seed: Option<u64>,
    pub logging_steps: Option<u32>,
    pub save_strategy: Option<String>,
}

impl TrainingOverrides {
    /// Fills every unset field from `other`.
    pub fn fill_from(&mut self, other: Self) {
        self.num_train_epochs = self.num_train_epochs.or(other.num_train_epochs);
        self.per_device_train_batch_size =
            self.per_device_train_batch_size.or(other.per_device_train_batch_size);
        self.gradient_accumulation_steps =
            self.gradient_accumulation_steps.or(other.gradient_accumulation_steps);
        self.learning_rate = self.learning_rate.or(other.learning_rate);
        self.warmup_ratio = self.warmup_ratio.or(other.warmup_ratio);
        self.max_length = self.max_length.or(other.max_length);
        self.fp16 = self.fp16.or(other.fp16);
        self.bf16 = self.bf16.or(other.bf16);
        self.optim = self.optim.take().or(other.optim);
        self.weight_decay = self.weight_decay.or(other.weight_decay);
        self.max_grad_norm = self.max_grad_norm.or(other.max_grad_norm);
        self.lr_scheduler_type = self.lr_scheduler_type.take().or(other.lr_scheduler_type);
        self.neftune_noise_alpha = self.neftune_noise_alpha.or(other.neftune_noise_alpha);
        self.seed = self.seed.or(other.seed);
        self.logging_steps = self.logging_steps.or(other.logging_steps);
        self.save_strategy = self.save_strategy.take().or(other.save_strategy);
    }
}

/// Effective training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub num_train_epochs: u32,
    pub per_device_train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub warmup_ratio: f64,
    pub max_length: usize,
    /// Half precision as configured; see [`TrainingParams::use_fp16`].
    pub fp16: bool,
    pub bf16: bool,
    pub optim: String,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub lr_scheduler_type: String,
    /// Zero disables NEFTune.
    pub neftune_noise_alpha: f64,
    pub seed: u64,
    pub logging_steps: u32,
    pub save_strategy: String,
}

impl TrainingParams {
    #[must_use]
    pub fn resolve(overrides: &TrainingOverrides, device: DeviceKind) -> Self {
        let cuda = device.is_cuda();
        let bf16 = overrides.bf16.unwrap_or(false);
        let fp16 = overrides.fp16.unwrap_or(cuda);

        Self {
            num_train_epochs: overrides.num_train_epochs.unwrap_or(DEFAULT_EPOCHS),
            per_device_train_batch_size: overrides.per_device_train_batch_size.unwrap_or(if cuda {
                DEFAULT_BATCH_SIZE_CUDA
            } else {
                DEFAULT_BATCH_SIZE_CPU
            }),
            gradient_accumulation_steps: overrides
                .gradient_accumulation_steps
                .unwrap_or(DEFAULT_GRADIENT_ACCUMULATION),
            learning_rate: overrides.learning_rate.unwrap_or(if cuda {
                DEFAULT_LEARNING_RATE_CUDA
            } else {
                DEFAULT_LEARNING_RATE_CPU
            }),
            warmup_ratio: overrides.warmup_ratio.unwrap_or(if cuda {
                DEFAULT_WARMUP_RATIO_CUDA
            } else {
                DEFAULT_WARMUP_RATIO_CPU
            }),
            max_length: overrides.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
            fp16,
            bf16,
            optim: overrides
                .optim
                .clone()
                .unwrap_or_else(|| if cuda { DEFAULT_OPTIM_CUDA } else { DEFAULT_OPTIM_CPU }.to_string()),
            weight_decay: overrides.weight_decay.unwrap_or(DEFAULT_WEIGHT_DECAY),
            max_grad_norm: overrides.max_grad_norm.unwrap_or(DEFAULT_MAX_GRAD_NORM),
            lr_scheduler_type: overrides
                .lr_scheduler_type
                .clone()
                .unwrap_or_else(|| DEFAULT_LR_SCHEDULER_TYPE.to_string()),
            neftune_noise_alpha: overrides.neftune_noise_alpha.unwrap_or(DEFAULT_NEFTUNE_NOISE_ALPHA),
            seed: overrides.seed.unwrap_or(DEFAULT_SEED),
            logging_steps: overrides.logging_steps.unwrap_or(if cuda {
                DEFAULT_LOGGING_STEPS_CUDA
            } else {
                DEFAULT_LOGGING_STEPS_CPU
            }),
            save_strategy: overrides
                .save_strategy
                .clone()
                .unwrap_or_else(|| DEFAULT_SAVE_STRATEGY.to_string()),
        }
    }

    /// Whether training runs in fp16. `bf16` wins when both are set.
    #[must_use]
    pub fn use_fp16(&self) -> bool {
        self.fp16 && !self.bf16
    }

    /// Whether NEFTune noise should be applied.
    #[must_use]
    pub fn neftune_enabled(&self) -> bool {
        self.neftune_noise_alpha > 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOverrides {
    pub r: Option<u32>,
    pub lora_alpha: Option<u32>,
    pub lora_dropout: Option<f64>,
    pub target_modules: Option<Vec<String>>,
    pub bias: Option<String>,
    pub use_rslora: Option<bool>,
    pub use_dora: Option<bool>,
    pub modules_to_save: Option<Vec<String>>,
}

impl AdapterOverrides {
    pub fn fill_from(&mut self, other: Self) {
        self.r = self.r.or(other.r);
        self.lora_alpha = self.lora_alpha.or(other.lora_alpha);
        self.lora_dropout = self.lora_dropout.or(other.lora_dropout);
        self.target_modules = self.target_modules.take().or(other.target_modules);
        self.bias = self.bias.take().or(other.bias);
        self.use_rslora = self.use_rslora.or(other.use_rslora);
        self.use_dora = self.use_dora.or(other.use_dora);
        self.modules_to_save = self.modules_to_save.take().or(other.modules_to_save);
    }
}

/// Effective low-rank adapter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterParams {
    pub r: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    pub bias: String,
    pub use_rslora: bool,
    pub use_dora: bool,
    /// `None` when unset or set to an empty list.
    pub modules_to_save: Option<Vec<String>>,
}

impl AdapterParams {
    #[must_use]
    pub fn resolve(overrides: &AdapterOverrides) -> Self {
        Self {
            r: overrides.r.unwrap_or(DEFAULT_LORA_R),
            lora_alpha: overrides.lora_alpha.unwrap_or(DEFAULT_LORA_ALPHA),
            lora_dropout: overrides.lora_dropout.unwrap_or(DEFAULT_LORA_DROPOUT),
            target_modules: overrides.target_modules.clone().unwrap_or_else(|| {
                DEFAULT_LORA_TARGET_MODULES.iter().map(ToString::to_string).collect()
            }),
            bias: overrides.bias.clone().unwrap_or_else(|| DEFAULT_LORA_BIAS.to_string()),
            use_rslora: overrides.use_rslora.unwrap_or(false),
            use_dora: overrides.use_dora.unwrap_or(false),
            modules_to_save: overrides.modules_to_save.clone().filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationOverrides {
    pub load_in_4bit: Option<bool>,
    pub bnb_4bit_quant_type: Option<String>,
    pub bnb_4bit_use_double_quant: Option<bool>,
    pub bnb_4bit_compute_dtype: Option<String>,
    pub output_quantization: Option<String>,
}

impl QuantizationOverrides {
    pub fn fill_from(&mut self, other: Self) {
        self.load_in_4bit = self.load_in_4bit.or(other.load_in_4bit);
        self.bnb_4bit_quant_type = self.bnb_4bit_quant_type.take().or(other.bnb_4bit_quant_type);
        self.bnb_4bit_use_double_quant =
            self.bnb_4bit_use_double_quant.or(other.bnb_4bit_use_double_quant);
        self.bnb_4bit_compute_dtype =
            self.bnb_4bit_compute_dtype.take().or(other.bnb_4bit_compute_dtype);
        self.output_quantization = self.output_quantization.take().or(other.output_quantization);
    }
}

/// Effective load-time quantization and export variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub load_in_4bit: bool,
    pub bnb_4bit_quant_type: String,
    pub bnb_4bit_use_double_quant: bool,
    pub bnb_4bit_compute_dtype: String,
    pub output_quantization: String,
}

impl QuantizationParams {
    #[must_use]
    pub fn resolve(overrides: &QuantizationOverrides) -> Self {
        Self {
            load_in_4bit: overrides.load_in_4bit.unwrap_or(true),
            bnb_4bit_quant_type: overrides
                .bnb_4bit_quant_type
                .clone()
                .unwrap_or_else(|| DEFAULT_BNB_4BIT_QUANT_TYPE.to_string()),
            bnb_4bit_use_double_quant: overrides.bnb_4bit_use_double_quant.unwrap_or(true),
            bnb_4bit_compute_dtype: overrides
                .bnb_4bit_compute_dtype
                .clone()
                .unwrap_or_else(|| DEFAULT_BNB_4BIT_COMPUTE_DTYPE.to_string()),
            output_quantization: overrides
                .output_quantization
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_QUANTIZATION.to_string()),
        }
    }

    /// Export variant for the conversion tool.
    ///
    /// A requested variant other than the default `q8_0` wins over the
    /// configured `output_quantization`.
    #[must_use]
    pub fn output_variant(&self, requested: &str) -> String {
        if requested.is_empty() || requested == DEFAULT_OUTPUT_QUANTIZATION {
            self.output_quantization.clone()
        } else {
            requested.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelfileOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub system: Option<String>,
    pub repeat_penalty: Option<f64>,
    pub repeat_last_n: Option<u32>,
    pub num_ctx: Option<u32>,
}

impl ModelfileOverrides {
    pub fn fill_from(&mut self, other: Self) {
        self.temperature = self.temperature.or(other.temperature);
        self.top_p = self.top_p.or(other.top_p);
        self.top_k = self.top_k.or(other.top_k);
        self.stop = self.stop.take().or(other.stop);
        self.system = self.system.take().or(other.system);
        self.repeat_penalty = self.repeat_penalty.or(other.repeat_penalty);
        self.repeat_last_n = self.repeat_last_n.or(other.repeat_last_n);
        self.num_ctx = self.num_ctx.or(other.num_ctx);
    }
}

/// Effective inference parameters written into the runtime's Modelfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelfileParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub stop: Vec<String>,
    pub system: String,
    pub repeat_penalty: f64,
    pub repeat_last_n: u32,
    pub num_ctx: u32,
}

impl ModelfileParams {
    #[must_use]
    pub fn resolve(overrides: &ModelfileOverrides) -> Self {
        Self {
            temperature: overrides.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: overrides.top_p.unwrap_or(DEFAULT_TOP_P),
            top_k: overrides.top_k.unwrap_or(DEFAULT_TOP_K),
            stop: overrides.stop.clone().unwrap_or_else(|| vec![DEFAULT_STOP.to_string()]),
            system: overrides.system.clone().unwrap_or_else(|| DEFAULT_SYSTEM.to_string()),
            repeat_penalty: overrides.repeat_penalty.unwrap_or(DEFAULT_REPEAT_PENALTY),
            repeat_last_n: overrides.repeat_last_n.unwrap_or(DEFAULT_REPEAT_LAST_N),
            num_ctx: overrides.num_ctx.unwrap_or(DEFAULT_NUM_CTX),
        }
    }
}

/// Immutable snapshot of the four override categories attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(rename = "trainingConfig")]
    pub training: Option<TrainingOverrides>,
    #[serde(rename = "loraConfig")]
    pub adapter: Option<AdapterOverrides>,
    #[serde(rename = "quantizationConfig")]
    pub quantization: Option<QuantizationOverrides>,
    #[serde(rename = "modelfileConfig")]
    pub modelfile: Option<ModelfileOverrides>,
}

impl ConfigOverrides {
    /// Loads overrides from `<project_root>/project.json`.
    ///
    /// Never fails: a missing or unreadable file yields empty overrides and a
    /// malformed section yields `None` for that section.
    #[must_use]
    pub fn from_project_dir(project_root: &Path) -> Self {
        let path = project_root.join(PROJECT_FILE);
        if !path.exists() {
            return Self::default();
        }

        let value: serde_json::Value = match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable project file");
                return Self::default();
            }
        };

        Self {
            training: parse_section(&value, "trainingConfig"),
            adapter: parse_section(&value, "loraConfig"),
            quantization: parse_section(&value, "quantizationConfig"),
            modelfile: parse_section(&value, "modelfileConfig"),
        }
    }

    /// Layers `base` underneath `self`, field by field.
    #[must_use]
    pub fn layered_over(mut self, base: Self) -> Self {
        self.training = layer(self.training, base.training, TrainingOverrides::fill_from);
        self.adapter = layer(self.adapter, base.adapter, AdapterOverrides::fill_from);
        self.quantization =
            layer(self.quantization, base.quantization, QuantizationOverrides::fill_from);
        self.modelfile = layer(self.modelfile, base.modelfile, ModelfileOverrides::fill_from);
        self
    }

    #[must_use]
    pub fn training_params(&self, device: DeviceKind) -> TrainingParams {
        TrainingParams::resolve(&self.training.clone().unwrap_or_default(), device)
    }

    #[must_use]
    pub fn adapter_params(&self) -> AdapterParams {
        AdapterParams::resolve(&self.adapter.clone().unwrap_or_default())
    }

    #[must_use]
    pub fn quantization_params(&self) -> QuantizationParams {
        QuantizationParams::resolve(&self.quantization.clone().unwrap_or_default())
    }

    #[must_use]
    pub fn modelfile_params(&self) -> ModelfileParams {
        ModelfileParams::resolve(&self.modelfile.clone().unwrap_or_default())
    }
}

fn layer<T>(top: Option<T>, base: Option<T>, fill: fn(&mut T, T)) -> Option<T> {
    match (top, base) {
        (Some(mut top), Some(base)) => {
            fill(&mut top, base);
            Some(top)
        }
        (top, base) => top.or(base),
    }
}

fn parse_section<T: DeserializeOwned>(value: &serde_json::Value, key: &str) -> Option<T> {
    let section = value.get(key)?;
    match section.as_object() {
        Some(map) if !map.is_empty() => {}
        _ => return None,
    }
    match serde_json::from_value(section.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(section = key, error = %e, "Ignoring malformed project config section");
            None
        }
    }
}
