//! Configuration validation
//!
//! Hard errors stop the run before anything is started; soft problems are
//! logged as warnings.

use super::*;
use anyhow::Result;
use tracing::warn;

/// Validate complete configuration
///
/// Expects a normalized configuration (see [`Config::normalize`]).
pub fn validate_config(config: &Config) -> Result<()> {
    validate_pool(&config.pool)?;
    validate_memory(&config.memory)?;
    validate_io(config)?;
    validate_runtime(&config.runtime)?;

    warn_on_oversubscription(config);
    Ok(())
}

/// Validate pool sizing
pub fn validate_pool(pool: &PoolConfig) -> Result<()> {
    if pool.min_threads == 0 {
        anyhow::bail!("min_threads must be at least 1");
    }

    if pool.max_threads < pool.min_threads {
        anyhow::bail!(
            "max_threads ({}) must not be below min_threads ({})",
            pool.max_threads,
            pool.min_threads
        );
    }

    // At least one worker has to run next to the I/O threads
    if pool.io_threads >= pool.min_threads {
        anyhow::bail!(
            "io_threads ({}) must be below min_threads ({})",
            pool.io_threads,
            pool.min_threads
        );
    }

    Ok(())
}

/// Validate the memory budget
pub fn validate_memory(memory: &MemoryConfig) -> Result<()> {
    if memory.max_io_size == 0 || memory.max_io_size > MAX_IO_SIZE_LIMIT {
        anyhow::bail!(
            "max_io_size must be between 1 and {:#x}, got {}",
            MAX_IO_SIZE_LIMIT,
            memory.max_io_size
        );
    }

    if memory.max_memory != 0 && memory.max_io_size > memory.max_memory {
        anyhow::bail!(
            "max_io_size ({}) exceeds max_memory ({})",
            memory.max_io_size,
            memory.max_memory
        );
    }

    Ok(())
}

/// Validate the data file settings
pub fn validate_io(config: &Config) -> Result<()> {
    if config.io.data_file.as_os_str().is_empty() {
        anyhow::bail!("data_file path must not be empty");
    }

    let file_size = config.data_file_size();
    if file_size <= config.memory.max_io_size {
        anyhow::bail!(
            "data file size ({}) must exceed max_io_size ({})",
            file_size,
            config.memory.max_io_size
        );
    }

    Ok(())
}

/// Validate the run clock
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.duration_secs < 1 {
        anyhow::bail!("duration must be at least 1 second");
    }

    if runtime.poll_interval_ms == 0 {
        anyhow::bail!("poll_interval must be at least 1ms");
    }

    Ok(())
}

fn warn_on_oversubscription(config: &Config) {
    let cpus = num_cpus::get();
    if config.pool.min_threads <= cpus {
        warn!(
            min_threads = config.pool.min_threads,
            cpus, "min_threads does not exceed the online CPU count"
        );
    }

    if config.memory.max_memory > 0 {
        let demand = (config.worker_slots() as u64).saturating_mul(config.memory.max_io_size);
        if demand > config.memory.max_memory {
            warn!(
                demand,
                max_memory = config.memory.max_memory,
                "workers can ask for more than max_memory; allocations will be refused"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::new(4, "/tmp/data.dat");
        config.pool.max_threads = 8;
        config.pool.io_threads = 2;
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_pool() {
        let mut config = valid_config();
        config.pool.min_threads = 0;
        assert!(validate_pool(&config.pool).is_err());

        let mut config = valid_config();
        config.pool.max_threads = 3;
        assert!(validate_pool(&config.pool).is_err());

        let mut config = valid_config();
        config.pool.io_threads = 4;
        assert!(validate_pool(&config.pool).is_err());

        // No I/O at all is fine
        let mut config = valid_config();
        config.pool.io_threads = 0;
        assert!(validate_pool(&config.pool).is_ok());
    }

    #[test]
    fn test_validate_memory() {
        let mut config = valid_config();
        config.memory.max_io_size = 0;
        assert!(validate_memory(&config.memory).is_err());

        config.memory.max_io_size = MAX_IO_SIZE_LIMIT + 1;
        assert!(validate_memory(&config.memory).is_err());

        config.memory.max_io_size = MAX_IO_SIZE_LIMIT;
        assert!(validate_memory(&config.memory).is_ok());

        config.memory.max_io_size = 2 * 1024 * 1024;
        config.memory.max_memory = 1024 * 1024;
        assert!(validate_memory(&config.memory).is_err());
    }

    #[test]
    fn test_validate_io() {
        let mut config = valid_config();
        config.io.data_file = PathBuf::new();
        assert!(validate_io(&config).is_err());

        let mut config = valid_config();
        config.io.max_file_size = Some(config.memory.max_io_size);
        assert!(validate_io(&config).is_err());

        config.io.max_file_size = Some(config.memory.max_io_size + 1);
        assert!(validate_io(&config).is_ok());
    }

    #[test]
    fn test_validate_runtime() {
        let mut config = valid_config();
        config.runtime.duration_secs = 0;
        assert!(validate_runtime(&config.runtime).is_err());

        let mut config = valid_config();
        config.runtime.poll_interval_ms = 0;
        assert!(validate_runtime(&config.runtime).is_err());
    }

    #[test]
    fn test_oversubscribed_memory_is_only_a_warning() {
        let mut config = valid_config();
        config.memory.max_memory = 2 * 1024 * 1024;
        assert!(validate_config(&config).is_ok());
    }
}
