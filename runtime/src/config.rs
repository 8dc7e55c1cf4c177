use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub gas: GasConfig,
    pub dispatcher: DispatcherConfig,
    pub sandbox: SandboxConfig,
    pub tee: TeeConfig,
}

/// Persistent storage engine settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_path: PathBuf,
    pub enable_encryption: bool,
    pub enable_compression: bool,
    /// Deflate level, 1..=9
    pub compression_level: u32,
    pub create_if_missing: bool,
    pub max_chunk_size: usize,
    pub enable_caching: bool,
    pub cache_size_bytes: usize,
    pub enable_auto_flush: bool,
    pub auto_flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./sealvm-data"),
            enable_encryption: true,
            enable_compression: true,
            compression_level: 6,
            create_if_missing: true,
            max_chunk_size: 4 * 1024 * 1024,
            enable_caching: true,
            cache_size_bytes: 50 * 1024 * 1024,
            enable_auto_flush: true,
            auto_flush_interval_ms: 5000,
        }
    }
}

/// Gas accounting settings
#[derive(Debug, Clone)]
pub struct GasConfig {
    pub max_gas_limit: u64,
    pub enable_time_based_gas: bool,
    /// Units accrued per millisecond of wall time
    pub gas_per_ms: u64,
    pub basic_op_gas: u64,
    pub memory_gas_per_byte: f64,
    pub storage_gas_per_byte: f64,
    pub crypto_op_gas: u64,
    pub timer_arm_gas: u64,
    pub timer_fire_gas: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            max_gas_limit: 300_000_000,
            enable_time_based_gas: true,
            gas_per_ms: 10,
            basic_op_gas: 1,
            memory_gas_per_byte: 0.1,
            storage_gas_per_byte: 1.0,
            crypto_op_gas: 50,
            timer_arm_gas: 15,
            timer_fire_gas: 5,
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_executions: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            queue_capacity: 32,
        }
    }
}

/// Sandbox settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// QuickJS WASM binary carrying the sealvm host bridge
    pub quickjs_wasm_path: PathBuf,
    /// Fuel budget per run (instruction-ish accounting)
    pub max_fuel: u64,
    pub max_memory_mb: u32,
    /// When set, only scripts with an allowlisted SHA-256 digest run
    pub code_allowlist: Option<HashSet<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            quickjs_wasm_path: PathBuf::from("./quickjs.wasm"),
            max_fuel: 10_000_000_000,
            max_memory_mb: 128,
            code_allowlist: None,
        }
    }
}

/// TEE platform settings
#[derive(Debug, Clone)]
pub struct TeeConfig {
    pub mode: TeeModeConfig,
    /// Attestation pseudo-device directory (hardware mode)
    pub attestation_device_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeModeConfig {
    Hardware,
    Simulation,
}

impl Default for TeeConfig {
    fn default() -> Self {
        Self {
            mode: TeeModeConfig::Simulation,
            attestation_device_dir: PathBuf::from("/dev/attestation"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// All variables are optional; unset ones take the defaults above.
    /// Recognized variables:
    /// - SEALVM_STORAGE_PATH, SEALVM_ENABLE_ENCRYPTION, SEALVM_ENABLE_COMPRESSION,
    ///   SEALVM_COMPRESSION_LEVEL, SEALVM_CREATE_IF_MISSING, SEALVM_MAX_CHUNK_SIZE,
    ///   SEALVM_ENABLE_CACHING, SEALVM_CACHE_SIZE_BYTES, SEALVM_ENABLE_AUTO_FLUSH,
    ///   SEALVM_AUTO_FLUSH_INTERVAL_MS
    /// - SEALVM_MAX_GAS_LIMIT, SEALVM_ENABLE_TIME_BASED_GAS, SEALVM_GAS_PER_MS,
    ///   SEALVM_BASIC_OP_GAS, SEALVM_MEMORY_GAS_PER_BYTE, SEALVM_STORAGE_GAS_PER_BYTE,
    ///   SEALVM_CRYPTO_OP_GAS, SEALVM_TIMER_ARM_GAS, SEALVM_TIMER_FIRE_GAS
    /// - SEALVM_MAX_CONCURRENT_EXECUTIONS, SEALVM_QUEUE_CAPACITY
    /// - SEALVM_QJS_WASM, SEALVM_MAX_FUEL, SEALVM_MAX_MEMORY_MB,
    ///   SEALVM_CODE_ALLOWLIST (comma-separated hex digests)
    /// - SEALVM_TEE_MODE (hardware | simulation), SEALVM_ATTESTATION_DEVICE_DIR
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenv::dotenv().ok();

        let defaults = Config::default();

        let storage = StorageConfig {
            storage_path: opt_path("SEALVM_STORAGE_PATH", defaults.storage.storage_path),
            enable_encryption: opt_bool("SEALVM_ENABLE_ENCRYPTION", true)?,
            enable_compression: opt_bool("SEALVM_ENABLE_COMPRESSION", true)?,
            compression_level: opt_parse("SEALVM_COMPRESSION_LEVEL", 6)?,
            create_if_missing: opt_bool("SEALVM_CREATE_IF_MISSING", true)?,
            max_chunk_size: opt_parse("SEALVM_MAX_CHUNK_SIZE", defaults.storage.max_chunk_size)?,
            enable_caching: opt_bool("SEALVM_ENABLE_CACHING", true)?,
            cache_size_bytes: opt_parse("SEALVM_CACHE_SIZE_BYTES", defaults.storage.cache_size_bytes)?,
            enable_auto_flush: opt_bool("SEALVM_ENABLE_AUTO_FLUSH", true)?,
            auto_flush_interval_ms: opt_parse(
                "SEALVM_AUTO_FLUSH_INTERVAL_MS",
                defaults.storage.auto_flush_interval_ms,
            )?,
        };

        let gas = GasConfig {
            max_gas_limit: opt_parse("SEALVM_MAX_GAS_LIMIT", defaults.gas.max_gas_limit)?,
            enable_time_based_gas: opt_bool("SEALVM_ENABLE_TIME_BASED_GAS", true)?,
            gas_per_ms: opt_parse("SEALVM_GAS_PER_MS", defaults.gas.gas_per_ms)?,
            basic_op_gas: opt_parse("SEALVM_BASIC_OP_GAS", defaults.gas.basic_op_gas)?,
            memory_gas_per_byte: opt_parse(
                "SEALVM_MEMORY_GAS_PER_BYTE",
                defaults.gas.memory_gas_per_byte,
            )?,
            storage_gas_per_byte: opt_parse(
                "SEALVM_STORAGE_GAS_PER_BYTE",
                defaults.gas.storage_gas_per_byte,
            )?,
            crypto_op_gas: opt_parse("SEALVM_CRYPTO_OP_GAS", defaults.gas.crypto_op_gas)?,
            timer_arm_gas: opt_parse("SEALVM_TIMER_ARM_GAS", defaults.gas.timer_arm_gas)?,
            timer_fire_gas: opt_parse("SEALVM_TIMER_FIRE_GAS", defaults.gas.timer_fire_gas)?,
        };

        let dispatcher = DispatcherConfig {
            max_concurrent_executions: opt_parse(
                "SEALVM_MAX_CONCURRENT_EXECUTIONS",
                defaults.dispatcher.max_concurrent_executions,
            )?,
            queue_capacity: opt_parse("SEALVM_QUEUE_CAPACITY", defaults.dispatcher.queue_capacity)?,
        };

        let code_allowlist = env::var("SEALVM_CODE_ALLOWLIST").ok().map(|raw| {
            raw.split(',')
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect::<HashSet<_>>()
        });

        let sandbox = SandboxConfig {
            quickjs_wasm_path: opt_path("SEALVM_QJS_WASM", defaults.sandbox.quickjs_wasm_path),
            max_fuel: opt_parse("SEALVM_MAX_FUEL", defaults.sandbox.max_fuel)?,
            max_memory_mb: opt_parse("SEALVM_MAX_MEMORY_MB", defaults.sandbox.max_memory_mb)?,
            code_allowlist,
        };

        let mode = match env::var("SEALVM_TEE_MODE").as_deref() {
            Ok("hardware") => TeeModeConfig::Hardware,
            Ok("simulation") | Err(_) => TeeModeConfig::Simulation,
            Ok(other) => anyhow::bail!("Invalid SEALVM_TEE_MODE: {other} (hardware | simulation)"),
        };
        let tee = TeeConfig {
            mode,
            attestation_device_dir: opt_path(
                "SEALVM_ATTESTATION_DEVICE_DIR",
                defaults.tee.attestation_device_dir,
            ),
        };

        let config = Self {
            storage,
            gas,
            dispatcher,
            sandbox,
            tee,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=9).contains(&self.storage.compression_level) {
            anyhow::bail!("Compression level must be between 1 and 9");
        }

        if self.storage.max_chunk_size == 0 {
            anyhow::bail!("Max chunk size must be positive");
        }

        if self.storage.enable_auto_flush && self.storage.auto_flush_interval_ms == 0 {
            anyhow::bail!("Auto-flush interval must be positive");
        }

        if self.gas.max_gas_limit == 0 {
            anyhow::bail!("Max gas limit must be positive");
        }

        if self.gas.enable_time_based_gas && self.gas.gas_per_ms == 0 {
            anyhow::bail!("Gas per millisecond must be positive when time-based gas is enabled");
        }

        if self.gas.memory_gas_per_byte < 0.0 || self.gas.storage_gas_per_byte < 0.0 {
            anyhow::bail!("Per-byte gas costs cannot be negative");
        }

        if self.dispatcher.max_concurrent_executions == 0 {
            anyhow::bail!("Max concurrent executions must be at least 1");
        }

        if self.sandbox.max_fuel == 0 {
            anyhow::bail!("Sandbox fuel budget must be positive");
        }

        if self.sandbox.max_memory_mb == 0 {
            anyhow::bail!("Sandbox memory limit must be at least 1 MB");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            gas: GasConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sandbox: SandboxConfig::default(),
            tee: TeeConfig::default(),
        }
    }
}

fn opt_path(name: &str, default: PathBuf) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or(default)
}

fn opt_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<bool>()
            .with_context(|| format!("{name} must be 'true' or 'false'")),
        Err(_) => Ok(default),
    }
}

fn opt_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let mut config = Config::default();
        config.storage.compression_level = 0;
        assert!(config.validate().is_err());

        config.storage.compression_level = 10;
        assert!(config.validate().is_err());

        config.storage.compression_level = 6;
        assert!(config.validate().is_ok());

        config.dispatcher.max_concurrent_executions = 0;
        assert!(config.validate().is_err());
        config.dispatcher.max_concurrent_executions = 4;

        config.gas.enable_time_based_gas = true;
        config.gas.gas_per_ms = 0;
        assert!(config.validate().is_err());
    }
}
