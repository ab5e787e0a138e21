// Simulator configuration for procsim
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::scheduler::SchedulingAlgorithm;

/// Upper bound on simulated cores
pub const MAX_CPUS: usize = 128;

const DEFAULT_MAX_OVERALL_MEM: usize = 16384;
const DEFAULT_MEM_PER_FRAME: usize = 16;
const DEFAULT_MEM_PER_PROC: usize = 4096;

const REQUIRED_KEYS: [&str; 7] = [
    "num-cpu",
    "scheduler",
    "quantum-cycles",
    "batch-process-freq",
    "min-ins",
    "max-ins",
    "delays-per-exec",
];

/// Validated simulator configuration.
///
/// Built once at startup and handed to the scheduler, memory manager and
/// process service by reference. Nothing below this layer re-validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub num_cpu: usize,
    pub scheduler: SchedulingAlgorithm,
    pub quantum_cycles: u32,
    pub batch_process_freq: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    pub delays_per_exec: u32,
    #[serde(default = "default_max_overall_mem")]
    pub max_overall_mem: usize,
    #[serde(default = "default_mem_per_frame")]
    pub mem_per_frame: usize,
    #[serde(default = "default_mem_per_proc")]
    pub mem_per_proc: usize,
    #[serde(default = "default_report_log")]
    pub report_log: PathBuf,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

fn default_max_overall_mem() -> usize {
    DEFAULT_MAX_OVERALL_MEM
}

fn default_mem_per_frame() -> usize {
    DEFAULT_MEM_PER_FRAME
}

fn default_mem_per_proc() -> usize {
    DEFAULT_MEM_PER_PROC
}

fn default_report_log() -> PathBuf {
    PathBuf::from("csopesy-log.txt")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("memory_stamps")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cpu: 4,
            scheduler: SchedulingAlgorithm::FirstComeFirstServed,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delays_per_exec: 0,
            max_overall_mem: DEFAULT_MAX_OVERALL_MEM,
            mem_per_frame: DEFAULT_MEM_PER_FRAME,
            mem_per_proc: DEFAULT_MEM_PER_PROC,
            report_log: default_report_log(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("missing value for parameter: {0}")]
    MissingValue(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Config {
    /// Load and validate a config file.
    ///
    /// Files ending in `.toml` are read as TOML with kebab-case keys; anything
    /// else uses the whitespace separated `key value` format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&text)?
        } else {
            text.parse()?
        };

        log::info!(
            "Loaded config from {}: {} cpu(s), {} scheduler",
            path.display(),
            config.num_cpu,
            config.scheduler
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and the relationships between the memory parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpu < 1 || self.num_cpu > MAX_CPUS {
            return Err(invalid(format!(
                "Invalid number of CPUs (must be between 1 and {}): {}",
                MAX_CPUS, self.num_cpu
            )));
        }
        if self.quantum_cycles < 1 {
            return Err(invalid("Invalid quantum cycles (must be at least 1)"));
        }
        if self.batch_process_freq < 1 {
            return Err(invalid("Invalid batch process frequency (must be at least 1)"));
        }
        if self.min_ins < 1 {
            return Err(invalid("Invalid minimum instructions (must be at least 1)"));
        }
        if self.max_ins < self.min_ins {
            return Err(invalid(format!(
                "Invalid maximum instructions (must be greater than or equal to min-ins): {}",
                self.max_ins
            )));
        }
        if self.max_overall_mem == 0 {
            return Err(invalid("Max overall memory must be greater than 0"));
        }
        if self.mem_per_frame == 0 {
            return Err(invalid("Memory per frame must be greater than 0"));
        }
        if self.mem_per_proc == 0 {
            return Err(invalid("Memory per process must be greater than 0"));
        }
        if self.max_overall_mem % self.mem_per_frame != 0 {
            return Err(invalid("Memory size must be multiple of frame size"));
        }
        if self.mem_per_proc % self.mem_per_frame != 0 {
            return Err(invalid("Process memory must be multiple of frame size"));
        }
        if self.mem_per_proc > self.max_overall_mem {
            return Err(invalid("Process memory cannot be larger than total memory"));
        }
        if self.mem_per_frame > self.mem_per_proc {
            return Err(invalid("Frame size cannot be larger than process memory"));
        }
        Ok(())
    }

    pub fn is_round_robin(&self) -> bool {
        self.scheduler.is_round_robin()
    }

    pub fn total_frames(&self) -> usize {
        self.max_overall_mem / self.mem_per_frame
    }

    pub fn frames_per_process(&self) -> usize {
        self.mem_per_proc / self.mem_per_frame
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut config = Config::default();
        let mut seen: Vec<&str> = Vec::new();
        let mut tokens = text.split_whitespace();

        while let Some(key) = tokens.next() {
            let raw = tokens
                .next()
                .ok_or_else(|| ConfigError::MissingValue(key.to_string()))?;
            let value = raw.trim_matches('"');

            match key {
                "num-cpu" => config.num_cpu = parse_value(key, value)?,
                "scheduler" => config.scheduler = parse_value(key, value)?,
                "quantum-cycles" => config.quantum_cycles = parse_value(key, value)?,
                "batch-process-freq" => config.batch_process_freq = parse_value(key, value)?,
                "min-ins" => config.min_ins = parse_value(key, value)?,
                "max-ins" => config.max_ins = parse_value(key, value)?,
                "delays-per-exec" => config.delays_per_exec = parse_value(key, value)?,
                "max-overall-mem" => config.max_overall_mem = parse_value(key, value)?,
                "mem-per-frame" => config.mem_per_frame = parse_value(key, value)?,
                "mem-per-proc" => config.mem_per_proc = parse_value(key, value)?,
                "report-log" => config.report_log = PathBuf::from(value),
                "snapshot-dir" => config.snapshot_dir = PathBuf::from(value),
                _ => return Err(ConfigError::UnknownParameter(key.to_string())),
            }
            seen.push(key);
        }

        if let Some(missing) = REQUIRED_KEYS.iter().find(|key| !seen.contains(*key)) {
            return Err(ConfigError::MissingParameter(*missing));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
num-cpu 4
scheduler "rr"
quantum-cycles 5
batch-process-freq 1
min-ins 1000
max-ins 2000
delays-per-exec 0
max-overall-mem 16384
mem-per-frame 16
mem-per-proc 4096
"#;

    #[test]
    fn parses_native_format() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.num_cpu, 4);
        assert_eq!(config.scheduler, SchedulingAlgorithm::RoundRobin);
        assert_eq!(config.quantum_cycles, 5);
        assert_eq!(config.total_frames(), 1024);
        assert_eq!(config.frames_per_process(), 256);
        assert_eq!(config.report_log, PathBuf::from("csopesy-log.txt"));
    }

    #[test]
    fn memory_keys_are_optional() {
        let text = "num-cpu 1 scheduler fcfs quantum-cycles 1 batch-process-freq 1 \
                    min-ins 1 max-ins 1 delays-per-exec 0";
        let config: Config = text.parse().unwrap();
        assert_eq!(config.max_overall_mem, 16384);
        assert_eq!(config.mem_per_frame, 16);
        assert_eq!(config.mem_per_proc, 4096);
    }

    #[test]
    fn rejects_unknown_parameter() {
        let text = format!("{SAMPLE}\nturbo 1");
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::UnknownParameter(key)) if key == "turbo"
        ));
    }

    #[test]
    fn rejects_missing_required_parameter() {
        let text = SAMPLE.replace("delays-per-exec 0", "");
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::MissingParameter("delays-per-exec"))
        ));
    }

    #[test]
    fn rejects_out_of_range_cpu_count() {
        let text = SAMPLE.replace("num-cpu 4", "num-cpu 129");
        assert!(matches!(text.parse::<Config>(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_scheduler() {
        let text = SAMPLE.replace("\"rr\"", "\"sjf\"");
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "scheduler"
        ));
    }

    #[test]
    fn rejects_bad_memory_relationships() {
        let mut config = Config::default();
        config.mem_per_frame = 24;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mem_per_proc = 32768;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mem_per_frame = 8192;
        config.mem_per_proc = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let text = r#"
num-cpu = 2
scheduler = "fcfs"
quantum-cycles = 3
batch-process-freq = 2
min-ins = 10
max-ins = 20
delays-per-exec = 1
mem-per-proc = 64
"#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.num_cpu, 2);
        assert_eq!(config.scheduler, SchedulingAlgorithm::FirstComeFirstServed);
        assert_eq!(config.frames_per_process(), 4);
    }
}
