//! Paging status command implementation.

use sluice_paging::{AddressStatus, PagingConfig, PagingManager};
use std::path::Path;

/// Runs the paging-status command.
///
/// Opening the paging directory takes its lock, so this fails while a
/// broker is running on it.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("{} is not a directory", path.display()).into());
    }
    let manager = PagingManager::open(PagingConfig::new(path))?;
    let status = manager.status();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&status)?),
        _ => print_table(&status),
    }
    Ok(())
}

fn print_table(status: &[AddressStatus]) {
    if status.is_empty() {
        println!("No paging stores");
        return;
    }
    println!(
        "{:<32} {:<8} {:>10} {:>12} {:>6}",
        "ADDRESS", "PAGING", "MESSAGES", "BYTES", "PAGES"
    );
    for address in status {
        println!(
            "{:<32} {:<8} {:>10} {:>12} {:>6}",
            address.address,
            if address.paging { "yes" } else { "no" },
            address.paged_messages,
            address.paged_bytes,
            address.page_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_paging::AddressSettings;
    use tempfile::tempdir;

    #[test]
    fn lists_paged_addresses() {
        let dir = tempdir().unwrap();
        {
            let config = PagingConfig::new(dir.path())
                .default_settings(AddressSettings::new().page_size_bytes(64))
                .sync_on_write(false);
            let manager = PagingManager::open(config).unwrap();
            manager.store("orders").unwrap().page(b"one").unwrap();
        }
        run(dir.path(), "text").unwrap();
        run(dir.path(), "json").unwrap();
    }

    #[test]
    fn locked_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let _manager = PagingManager::open(PagingConfig::new(dir.path())).unwrap();
        assert!(run(dir.path(), "text").is_err());
    }
}
