//! Configuration for the speech super-resolution training driver
//!
//! The effective configuration is assembled from four layers, lowest to
//! highest precedence: built-in defaults, the YAML file given by `--config`,
//! the JSON file given by `--config_json`, and flags explicitly present on the
//! command line. Once merged it is shared read-only for the whole run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, ValueEnum};
use config::FileFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::networks::NetworkKind;

/// What the process should do once configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Adversarial training
    #[default]
    Train,
    /// Super-resolve `input_path` with a trained checkpoint
    Inference,
}

/// Unified, flat training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Seed for every random source of the run
    pub seed: u64,
    pub mode: RunMode,
    /// Use an accelerator when one is available
    #[serde(deserialize_with = "flag::deserialize")]
    pub use_cuda: bool,
    pub checkpoint_dir: PathBuf,
    /// Network identifier, resolved through [`NetworkKind`]
    pub network: String,
    #[serde(deserialize_with = "flag::deserialize")]
    pub train_from_last_checkpoint: bool,
    /// Steps between progress reports
    pub print_freq: usize,
    /// Steps between checkpoints
    pub checkpoint_save_freq: usize,
    pub batch_size: usize,

    /// Training manifest
    pub tr_list: Option<PathBuf>,
    /// Validation manifest
    pub cv_list: Option<PathBuf>,
    /// Test manifest; unset or `none` disables the test split
    pub tt_list: Option<String>,
    #[serde(deserialize_with = "flag::deserialize")]
    pub accu_grad: bool,
    /// Training crop length in seconds
    pub max_length: f64,
    /// Low-resolution audio (file or manifest) for inference
    pub input_path: Option<PathBuf>,
    /// Accepted for recipe compatibility; this network derives its features in-model
    #[serde(deserialize_with = "flag::deserialize")]
    pub load_fbank: bool,

    /// Effective batch size targeted by gradient accumulation
    pub effec_batch_size: Option<usize>,
    pub max_epoch: usize,
    pub num_gpu: usize,
    pub weight_decay: f64,
    pub clip_grad_norm: f64,
    pub local_rank: usize,

    /// Generator and discriminator learning rate
    pub learning_rate: f64,
    /// Spectral mapper learning rate
    pub learning_rate_mossformer: f64,
    pub adam_b1: f64,
    pub adam_b2: f64,
    /// Multiplicative learning rate decay applied after each epoch
    pub lr_decay: f64,

    /// Target (high-resolution) sampling rate
    pub sampling_rate: u32,
    /// Rates the low-resolution input is simulated at
    pub lr_sampling_rates: Vec<u32>,
    pub num_workers: usize,

    pub hidden_channels: usize,
    /// Samples per analysis frame of the spectral mapper
    pub frame_hop: usize,
    pub lambda_wave: f64,
    pub lambda_adv: f64,
    pub early_stop_patience: usize,
    /// Upper bound on rendezvous with peer processes
    pub dist_timeout_secs: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: 20,
            mode: RunMode::Train,
            use_cuda: true,
            checkpoint_dir: PathBuf::from("checkpoints/MossFormer2_SR_48K"),
            network: NetworkKind::MossFormer2Sr48k.identifier().to_string(),
            train_from_last_checkpoint: false,
            print_freq: 10,
            checkpoint_save_freq: 50,
            batch_size: 4,
            tr_list: None,
            cv_list: None,
            tt_list: None,
            accu_grad: false,
            max_length: 4.0,
            input_path: None,
            load_fbank: false,
            effec_batch_size: None,
            max_epoch: 20,
            num_gpu: 1,
            weight_decay: 1e-5,
            clip_grad_norm: 10.0,
            local_rank: 0,
            learning_rate: 2e-4,
            learning_rate_mossformer: 5e-5,
            adam_b1: 0.8,
            adam_b2: 0.99,
            lr_decay: 0.999,
            sampling_rate: 48_000,
            lr_sampling_rates: vec![8_000, 16_000, 24_000, 32_000],
            num_workers: num_cpus::get().min(4),
            hidden_channels: 64,
            frame_hop: 120,
            lambda_wave: 45.0,
            lambda_adv: 1.0,
            early_stop_patience: 10,
            dist_timeout_secs: 1800,
        }
    }
}

impl TrainConfig {
    /// Validate ranges and mode-specific requirements
    pub fn validate(&self) -> Result<()> {
        self.network_kind()?;

        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than zero"));
        }
        if self.learning_rate <= 0.0 || self.learning_rate_mossformer <= 0.0 {
            return Err(Error::config("learning rates must be positive"));
        }
        for (name, beta) in [("adam_b1", self.adam_b1), ("adam_b2", self.adam_b2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::config(format!("{} must be in [0, 1), got {}", name, beta)));
            }
        }
        if self.lr_decay <= 0.0 || self.lr_decay > 1.0 {
            return Err(Error::config("lr_decay must be in (0, 1]"));
        }
        if self.max_length <= 0.0 {
            return Err(Error::config("max_length must be positive"));
        }
        if self.sampling_rate == 0 {
            return Err(Error::config("sampling_rate must be positive"));
        }
        if self.lr_sampling_rates.is_empty() {
            return Err(Error::config("lr_sampling_rates must not be empty"));
        }
        if let Some(rate) = self
            .lr_sampling_rates
            .iter()
            .find(|&&rate| rate == 0 || rate > self.sampling_rate)
        {
            return Err(Error::config(format!(
                "low-resolution rate {} must be in (0, {}]",
                rate, self.sampling_rate
            )));
        }
        if self.frame_hop == 0 || self.hidden_channels == 0 {
            return Err(Error::config("frame_hop and hidden_channels must be positive"));
        }
        if self.segment_samples() < self.frame_hop {
            return Err(Error::config("max_length is shorter than a single analysis frame"));
        }

        match self.mode {
            RunMode::Train => {
                if self.tr_list.is_none() || self.cv_list.is_none() {
                    return Err(Error::config("training requires both --tr-list and --cv-list"));
                }
            }
            RunMode::Inference => {
                if self.input_path.is_none() {
                    return Err(Error::config("inference requires --input-path"));
                }
            }
        }

        Ok(())
    }

    /// Resolve the configured network identifier
    pub fn network_kind(&self) -> Result<NetworkKind> {
        self.network.parse()
    }

    /// Test manifest, unless disabled with `none` (any case)
    pub fn test_list(&self) -> Option<&Path> {
        match self.tt_list.as_deref().map(str::trim) {
            None => None,
            Some(list) if list.is_empty() || list.eq_ignore_ascii_case("none") => None,
            Some(list) => Some(Path::new(list)),
        }
    }

    /// Training crop length in samples, rounded down to whole analysis frames
    pub fn segment_samples(&self) -> usize {
        let samples = (self.max_length * self.sampling_rate as f64) as usize;
        samples - samples % self.frame_hop.max(1)
    }

    /// Micro-batches per optimizer step
    pub fn accumulation_steps(&self, world_size: usize) -> usize {
        if !self.accu_grad {
            return 1;
        }
        let per_step = self.batch_size * world_size.max(1);
        self.effec_batch_size
            .map(|effective| (effective / per_step).max(1))
            .unwrap_or(1)
    }
}

/// Command-line interface of the training driver
///
/// Every configuration flag is optional so that only flags the operator
/// actually typed override the file layers.
#[derive(Parser, Debug, Default, Clone, Serialize)]
#[command(name = "speech-sr", version)]
#[command(about = "Train a GAN-based speech super-resolution model", long_about = None)]
pub struct CliArgs {
    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    #[serde(skip)]
    pub quiet: bool,

    /// Use JSON log output
    #[arg(long)]
    #[serde(skip)]
    pub json: bool,

    /// Structured (YAML) configuration file
    #[arg(long, env = "SPEECH_SR_CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// JSON configuration overrides
    #[arg(long = "config_json", alias = "config-json")]
    #[serde(skip)]
    pub config_json: Option<PathBuf>,

    /// The random seed
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Run train or inference
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,

    /// Use cuda (0 or 1)
    #[arg(long = "use-cuda", alias = "use_cuda", value_parser = clap::value_parser!(u8).range(0..=1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cuda: Option<u8>,

    /// The checkpoint directory
    #[arg(long = "checkpoint_dir", alias = "checkpoint-dir")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    /// The network to train
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Resume from the last checkpoint (0 or 1)
    #[arg(long = "train_from_last_checkpoint", value_parser = clap::value_parser!(u8).range(0..=1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_from_last_checkpoint: Option<u8>,

    /// Steps between progress reports
    #[arg(long = "print_freq")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_freq: Option<usize>,

    /// Steps between checkpoints
    #[arg(long = "checkpoint_save_freq")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_save_freq: Option<usize>,

    /// Batch size
    #[arg(long = "batch_size", alias = "batch-size")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// The train data list
    #[arg(long = "tr-list", alias = "tr_list")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tr_list: Option<PathBuf>,

    /// The cross-validation data list
    #[arg(long = "cv-list", alias = "cv_list")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv_list: Option<PathBuf>,

    /// Optional test data list, `none` disables testing
    #[arg(long = "tt-list", alias = "tt_list")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tt_list: Option<String>,

    /// Accumulate gradients up to the effective batch size (0 or 1)
    #[arg(long = "accu_grad", value_parser = clap::value_parser!(u8).range(0..=1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accu_grad: Option<u8>,

    /// Training crop length in seconds
    #[arg(long = "max_length", alias = "max-length")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<f64>,

    /// Low-resolution audio input for inference
    #[arg(long = "input-path", alias = "input_path")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_path: Option<PathBuf>,

    /// Load filterbank features (0 or 1)
    #[arg(long = "load_fbank", value_parser = clap::value_parser!(u8).range(0..=1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_fbank: Option<u8>,

    /// Effective batch size
    #[arg(long = "effec_batch_size")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effec_batch_size: Option<usize>,

    /// The max epochs
    #[arg(long = "max-epoch", alias = "max_epoch")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epoch: Option<usize>,

    /// Number of GPUs to use
    #[arg(long = "num-gpu", alias = "num_gpu")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gpu: Option<usize>,

    #[arg(long = "weight-decay", alias = "weight_decay")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,

    #[arg(long = "clip-grad-norm", alias = "clip_grad_norm")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_grad_norm: Option<f64>,

    /// Local rank when launched without a LOCAL_RANK environment
    #[arg(long = "local-rank", alias = "local_rank")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_rank: Option<usize>,
}

impl CliArgs {
    /// Parse the process arguments, ignoring flags this binary does not know
    pub fn parse_tolerant() -> Self {
        Self::parse_from(retain_known_flags(std::env::args()))
    }

    /// Parse an explicit argument list, ignoring unknown flags
    pub fn try_parse_tolerant<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::try_parse_from(retain_known_flags(args.into_iter().map(Into::into)))
    }
}

/// Drop unknown `--flags` (and their value, if separate) from an argument list
///
/// The first element is the program name and is always kept.
pub fn retain_known_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let command = CliArgs::command();
    let mut known_long: HashSet<String> = ["help", "version"].iter().map(|s| s.to_string()).collect();
    let mut known_short: HashSet<char> = ['h', 'V'].into_iter().collect();
    for arg in command.get_arguments() {
        if let Some(long) = arg.get_long() {
            known_long.insert(long.to_string());
        }
        if let Some(aliases) = arg.get_all_aliases() {
            known_long.extend(aliases.into_iter().map(str::to_string));
        }
        if let Some(short) = arg.get_short() {
            known_short.insert(short);
        }
    }

    let mut iter = args.into_iter().peekable();
    let mut kept = Vec::new();
    if let Some(program) = iter.next() {
        kept.push(program);
    }

    while let Some(arg) = iter.next() {
        if let Some(flag) = arg.strip_prefix("--") {
            let name = flag.split('=').next().unwrap_or_default();
            if flag.is_empty() || known_long.contains(name) {
                kept.push(arg);
                continue;
            }
            debug!("Ignoring unrecognized flag --{}", name);
            if !flag.contains('=') && iter.peek().is_some_and(|next| !looks_like_flag(next)) {
                iter.next();
            }
        } else if looks_like_flag(&arg) {
            if arg.chars().skip(1).all(|c| known_short.contains(&c)) {
                kept.push(arg);
            } else {
                debug!("Ignoring unrecognized flag {}", arg);
            }
        } else {
            kept.push(arg);
        }
    }

    kept
}

fn looks_like_flag(arg: &str) -> bool {
    arg.starts_with('-') && arg.len() > 1 && arg[1..].parse::<f64>().is_err()
}

/// Merge defaults, configuration files and explicit flags into one configuration
pub fn load_config(cli: &CliArgs) -> Result<TrainConfig> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&TrainConfig::default())?);

    if let Some(source) = read_config_file(cli.config.as_deref(), FileFormat::Yaml)? {
        builder = builder.add_source(source);
    }
    if let Some(source) = read_config_file(cli.config_json.as_deref(), FileFormat::Json)? {
        builder = builder.add_source(source);
    }
    builder = builder.add_source(config::Config::try_from(cli)?);

    let merged: TrainConfig = builder
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| Error::config(format!("failed to merge configuration: {}", e)))?;

    Ok(merged)
}

/// Parse a configuration file into a layer, tolerating paths that cannot be read
///
/// YAML is parsed with `serde_yaml` and JSON with `serde_json`, so syntax
/// errors carry their line and column. An empty file contributes nothing.
fn read_config_file(path: Option<&Path>, default_format: FileFormat) -> Result<Option<config::Config>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not read config file {}: {}; using remaining layers", path.display(), e);
            return Ok(None);
        }
    };

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        _ => default_format,
    };
    let layer = match format {
        FileFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(&content)?;
            match value {
                serde_json::Value::Null => None,
                serde_json::Value::Object(_) => Some(config::Config::try_from(&value)?),
                _ => return Err(Error::config(format!("{} must hold a mapping", path.display()))),
            }
        }
        _ => {
            let value: serde_yaml::Value = serde_yaml::from_str(&content)?;
            match value {
                serde_yaml::Value::Null => None,
                serde_yaml::Value::Mapping(_) => Some(config::Config::try_from(&value)?),
                _ => return Err(Error::config(format!("{} must hold a mapping", path.display()))),
            }
        }
    };
    debug!("Loaded config layer {} ({:?})", path.display(), format);

    Ok(layer)
}

/// Lenient boolean parsing for `0/1`, `true/false` style options
mod flag {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFlag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawFlag::deserialize(deserializer)? {
            RawFlag::Bool(value) => Ok(value),
            RawFlag::Int(value) => Ok(value != 0),
            RawFlag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(D::Error::custom(format!("invalid boolean flag '{}'", other))),
            },
        }
    }
}
