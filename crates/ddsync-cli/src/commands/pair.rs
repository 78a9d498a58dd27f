//! Pair and unpair commands.

use std::path::Path;

use anyhow::{Result, bail};

use crate::config::Config;

/// Add a device to the persisted paired list.
pub fn cmd_pair(handle: &str, config: &mut Config, path: &Path, quiet: bool) -> Result<()> {
    let handle = handle.trim();
    if handle.is_empty() {
        bail!("Device handle must not be empty. Run 'ddsync scan' to find nearby devices.");
    }
    if config.pair(handle) {
        config.save(path)?;
        if !quiet {
            println!("Paired {}", handle);
        }
    } else if !quiet {
        println!("{} is already paired", handle);
    }
    Ok(())
}

/// Remove a device from the persisted paired list.
pub fn cmd_unpair(handle: &str, config: &mut Config, path: &Path, quiet: bool) -> Result<()> {
    let handle = handle.trim();
    if config.unpair(handle) {
        config.save(path)?;
        if !quiet {
            println!("Unpaired {}", handle);
        }
    } else if !quiet {
        println!("{} was not paired", handle);
    }
    Ok(())
}
