use std::process::Command; // Run programs

use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions

#[test]
fn test_run_without_configuration_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tmpdir = tempfile::tempdir()?;

    let mut cmd = Command::cargo_bin("conveyor")?;
    cmd.current_dir(tmpdir.path()).arg("run");

    // conveyor cannot do anything without a configuration file, so this
    // should fail.
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("config"));

    Ok(())
}

#[test]
fn test_unknown_subcommand_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("conveyor")?;
    cmd.arg("explode");

    cmd.assert().failure();

    Ok(())
}
