//! Build steps run inside the extracted source tree.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error, info};

use super::InstallError;

/// Run each step in `dir`, stopping at the first non-zero exit.
pub async fn run_build_steps(dir: &Path, steps: &[Vec<String>]) -> Result<(), InstallError> {
    for (step, argv) in steps.iter().enumerate() {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let cmd_line = argv.join(" ");
        info!(step, "Running {cmd_line}");

        // Scripts shipped in the tree (./configure) resolve against the tree.
        let program = if program.starts_with("./") {
            dir.join(program).into_os_string()
        } else {
            program.into()
        };

        let output = Command::new(&program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InstallError::Build {
                step,
                command: cmd_line.clone(),
                reason: e.to_string(),
            })?;

        debug!(step, stdout = %String::from_utf8_lossy(&output.stdout), "Step output");
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("command failed: {cmd_line}\nstderr: {stderr}");
            return Err(InstallError::Build {
                step,
                command: cmd_line,
                reason: format!("{} {}", output.status, stderr.trim()),
            });
        }
    }
    Ok(())
}
