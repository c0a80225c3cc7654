//! Argument types shared by the command implementations.

use clap::{Args, ValueEnum};
use forge_training::DeviceKind;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Project name
    pub project: String,

    /// Base model identifier
    #[arg(short, long)]
    pub model: String,

    /// Data file under the project's data directory (repeatable, order kept)
    #[arg(short, long = "file", required = true)]
    pub files: Vec<String>,

    /// Output quantization variant for conversion (defaults to q8_0)
    #[arg(short, long)]
    pub quantization: Option<String>,

    /// Name to register the converted model under
    #[arg(short, long)]
    pub target_name: Option<String>,

    /// Print every progress update as a JSON line
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DefaultsArgs {
    /// Device to resolve device-dependent defaults for
    #[arg(short, long, value_enum, default_value_t = DeviceArg::Cpu)]
    pub device: DeviceArg,

    /// Layer this project's `project.json` over the defaults
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceArg {
    Cpu,
    Cuda,
    Mps,
}

impl From<DeviceArg> for DeviceKind {
    fn from(device: DeviceArg) -> Self {
        match device {
            DeviceArg::Cpu => Self::Cpu,
            DeviceArg::Cuda => Self::Cuda,
            DeviceArg::Mps => Self::Mps,
        }
    }
}
