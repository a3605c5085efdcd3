use std::{fmt, str::FromStr};

use clap::ValueEnum;
use itertools::Itertools;
use tch::{utils::has_mps, Device};
use thiserror::Error;

fn get_cuda_devices() -> Vec<usize> {
    (0..tch::Cuda::device_count() as usize).collect()
}

/// Get the optimal device for the current platform
///
/// Returns:
/// - MPS on macOS if available
/// - CUDA on other platforms if available
/// - CPU as fallback
pub fn get_optimal_devices() -> Devices {
    #[cfg(target_os = "macos")]
    {
        if has_mps() {
            return Devices::Mps;
        }
    }

    let cuda_device_indices = get_cuda_devices();
    if let Some(first) = cuda_device_indices.first() {
        return Devices::Cuda(*first);
    }

    Devices::Cpu
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Devices {
    Cpu,
    Mps,
    Cuda(usize),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Mps => write!(f, "MPS"),
            Devices::Cuda(index) => write!(f, "CUDA({index})"),
        }
    }
}

impl Devices {
    pub fn device(&self) -> Device {
        match self {
            Devices::Cpu => Device::Cpu,
            Devices::Mps => Device::Mps,
            Devices::Cuda(index) => Device::Cuda(*index),
        }
    }

    /// Whether work runs on an accelerator rather than the CPU fallback.
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Devices::Cpu)
    }
}

/// Get all available devices, for error messages
fn get_all_device_strings() -> Vec<String> {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    if has_mps() {
        strings.push("mps".to_owned());
    }
    let cuda = get_cuda_devices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.extend(cuda.into_iter().map(|idx| format!("cuda:{idx}")));
    }
    strings
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let available = || get_all_device_strings().into_iter().join(", ");
        match s.to_lowercase().as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => get_cuda_devices()
                .first()
                .map(|idx| Devices::Cuda(*idx))
                .ok_or_else(|| DevicesParseError::DeviceNotAvailable("CUDA".to_owned(), available())),
            "mps" => {
                if !has_mps() {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        "MPS".to_owned(),
                        available(),
                    ));
                }
                Ok(Devices::Mps)
            }
            s => match s.strip_prefix("cuda:") {
                Some(id_str) => {
                    let id = id_str.trim().parse::<usize>().map_err(|_| {
                        DevicesParseError::InvalidDeviceFormat(s.to_owned(), id_str.to_owned())
                    })?;
                    if !get_cuda_devices().contains(&id) {
                        return Err(DevicesParseError::DeviceNotAvailable(
                            format!("cuda:{id}"),
                            available(),
                        ));
                    }
                    Ok(Devices::Cuda(id))
                }
                None => Err(DevicesParseError::InvalidDevicesString(
                    s.to_string(),
                    available(),
                )),
            },
        }
    }
}

/// Numeric precision for forward and loss.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Full,
    /// fp16 autocast on CUDA, without loss scaling. Full precision elsewhere.
    Mixed,
}

/// Where and how tensors are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionEnvironment {
    pub devices: Devices,
    pub precision: Precision,
}

impl Default for ExecutionEnvironment {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ExecutionEnvironment {
    pub fn new(devices: Devices, precision: Precision) -> Self {
        Self { devices, precision }
    }

    pub fn cpu() -> Self {
        Self::new(Devices::Cpu, Precision::Full)
    }

    pub fn device(&self) -> Device {
        self.devices.device()
    }

    pub fn is_accelerated(&self) -> bool {
        self.devices.is_accelerated()
    }

    /// Whether `run_with_precision` actually lowers precision on this device.
    pub fn uses_autocast(&self) -> bool {
        self.precision == Precision::Mixed && matches!(self.devices, Devices::Cuda(_))
    }

    /// Runs `f` under the configured precision policy. Mixed precision is only
    /// applied on CUDA; elsewhere `f` runs in full precision.
    pub fn run_with_precision<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.uses_autocast() {
            tch::autocast(true, f)
        } else {
            f()
        }
    }
}
