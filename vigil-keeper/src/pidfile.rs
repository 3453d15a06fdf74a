//! The keeper pid file.
//!
//! The pid file guards against two keepers driving the same postgres
//! instance: the control loop checks every iteration that the file still
//! names this process, and aborts when another instance has taken over.

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Create the pid file for this process, refusing to take over from a still
/// running instance.
pub fn create(path: &Path) -> Result<()> {
    if let Some(existing) = read(path)? {
        if existing != std::process::id() && process_is_alive(existing) {
            bail!(
                "pid file {:?} names running process {}, refusing to start a second keeper",
                path,
                existing
            );
        }
        tracing::debug!(pid = existing, "removing stale pid file");
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("error creating run directory {:?}", parent))?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("error writing pid file {:?}", path))
}

/// Read the pid recorded in the file, `None` when the file does not exist.
pub fn read(path: &Path) -> Result<Option<u32>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("error reading pid file {:?}", path)),
    };
    let pid = contents
        .trim()
        .parse::<u32>()
        .with_context(|| format!("error parsing pid file {:?}", path))?;
    Ok(Some(pid))
}

/// Check that the pid file still names this process.
pub fn check_ownership(path: &Path) -> Result<()> {
    match read(path)? {
        Some(pid) if pid == std::process::id() => Ok(()),
        Some(pid) => bail!("pid file {:?} now names process {}, another keeper has taken over", path, pid),
        None => bail!("pid file {:?} has disappeared", path),
    }
}

/// Remove the pid file on the way out.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("error removing pid file {:?}", path)),
    }
}

fn process_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_names_this_process() -> Result<()> {
        let tmpdir = tempfile::tempdir_in("/tmp")?;
        let path = tmpdir.path().join("keeper.pid");

        create(&path)?;
        assert!(read(&path)? == Some(std::process::id()));
        check_ownership(&path)?;

        remove(&path)?;
        assert!(read(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn takeover_is_detected() -> Result<()> {
        let tmpdir = tempfile::tempdir_in("/tmp")?;
        let path = tmpdir.path().join("keeper.pid");

        create(&path)?;
        std::fs::write(&path, "999999999\n")?;
        assert!(check_ownership(&path).is_err(), "a foreign pid must fail the ownership check");

        std::fs::remove_file(&path)?;
        assert!(check_ownership(&path).is_err(), "a missing pid file must fail the ownership check");
        Ok(())
    }
}
