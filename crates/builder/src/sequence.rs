//! The build sequence
//!
//! Steps run strictly in order and the first failure aborts the rest. The
//! `/dev` bind mount is the only resource released on failure: it is held
//! across source checkout and provisioning and unmounted on every exit path
//! of that block. The working container is left for Job deletion to clean up.

use std::future::Future;

use crds::contract::{OUTPUT_MOUNT_PATH, SOURCE_MOUNT_PATH};
use tracing::{info, warn};

use crate::env::{BuilderEnv, Playbook, SourceRepo};
use crate::error::BuilderError;
use crate::runner::{CommandRunner, CommandSpec};

/// Files written by a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifacts {
    pub archive: String,
    pub disk_image: Option<String>,
}

/// Runs the whole build.
///
/// `auth_file` is the registry credential file to pull the base image
/// with, when one is mounted.
pub async fn run_build(
    runner: &dyn CommandRunner,
    env: &BuilderEnv,
    auth_file: Option<&str>,
) -> Result<BuildArtifacts, BuilderError> {
    info!(
        base_image = %env.base_image,
        arch = %env.arch,
        authenticated = auth_file.is_some(),
        "Creating working container"
    );
    let container = capture(runner, buildah_from(env, auth_file)).await?;
    let root = capture(runner, buildah("mount", &container)).await?;
    info!(container = %container, root = %root, "Mounted working container");

    with_device_bind(runner, &root, || provision(runner, env, &root)).await?;

    // Remount so everything the playbook wrote is visible before archiving
    runner.run(&buildah("umount", &container)).await?;
    let root = capture(runner, buildah("mount", &container)).await?;

    let artifacts = write_artifacts(runner, env, &root).await?;

    runner.run(&buildah("umount", &container)).await?;
    runner.run(&buildah("rm", &container)).await?;
    info!(container = %container, "Removed working container");

    Ok(artifacts)
}

/// Binds the host `/dev` into `root`, runs `body` and unmounts again
/// regardless of how `body` ended. A failed bind leaves nothing to release.
async fn with_device_bind<F, Fut>(runner: &dyn CommandRunner, root: &str, body: F) -> Result<(), BuilderError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), BuilderError>>,
{
    let dev = format!("{}/dev", root);
    runner
        .run(&CommandSpec::new("mount").args(["--bind", "/dev", dev.as_str()]))
        .await?;

    let result = body().await;
    let release = runner.run(&CommandSpec::new("umount").arg(dev.as_str())).await;

    match (result, release) {
        (Ok(()), release) => release.map(|_| ()),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("Failed to unmount {} after failed provisioning: {}", dev, release_err);
            Err(e)
        }
    }
}

async fn provision(runner: &dyn CommandRunner, env: &BuilderEnv, root: &str) -> Result<(), BuilderError> {
    if let Some(source) = &env.source {
        info!(repo = %source.url, branch = %source.branch, "Cloning provisioning source");
        runner.run(&git_clone(source)).await?;
    }
    if let Some(playbook) = &env.playbook {
        info!(playbook = %playbook.path, "Running playbook");
        runner.run(&ansible_playbook(playbook, root)).await?;
    }
    Ok(())
}

async fn write_artifacts(
    runner: &dyn CommandRunner,
    env: &BuilderEnv,
    root: &str,
) -> Result<BuildArtifacts, BuilderError> {
    // The archive is always produced; the disk image is built from it
    let archive = format!("{}/{}.tar.gz", OUTPUT_MOUNT_PATH, env.output_filename);
    runner
        .run(&CommandSpec::new("tar").args(["-czf", archive.as_str(), "-C", root, "."]))
        .await?;
    info!("Wrote {}", archive);

    let disk_image = if env.wants_qcow2() {
        let image = format!("{}/{}.qcow2", OUTPUT_MOUNT_PATH, env.output_filename);
        runner
            .run(&CommandSpec::new("virt-make-fs").args([
                "--format=qcow2",
                "--type=ext4",
                archive.as_str(),
                image.as_str(),
            ]))
            .await?;
        info!("Wrote {}", image);
        Some(image)
    } else {
        None
    };

    Ok(BuildArtifacts { archive, disk_image })
}

/// Runs a command whose last line of output names a resource.
async fn capture(runner: &dyn CommandRunner, command: CommandSpec) -> Result<String, BuilderError> {
    let command = command.captured();
    let output = runner.run(&command).await?;
    output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BuilderError::EmptyOutput(command.to_string()))
}

fn buildah(subcommand: &str, container: &str) -> CommandSpec {
    CommandSpec::new("buildah").args([subcommand, container])
}

fn buildah_from(env: &BuilderEnv, auth_file: Option<&str>) -> CommandSpec {
    let mut cmd = CommandSpec::new("buildah").args(["from", "--arch", env.arch.as_str()]);
    if let Some(path) = auth_file {
        cmd = cmd.args(["--authfile", path]);
    }
    cmd.arg(env.base_image.as_str())
}

fn git_clone(source: &SourceRepo) -> CommandSpec {
    CommandSpec::new("git").args([
        "clone",
        "--depth",
        "1",
        "--branch",
        source.branch.as_str(),
        source.url.as_str(),
        SOURCE_MOUNT_PATH,
    ])
}

fn ansible_playbook(playbook: &Playbook, root: &str) -> CommandSpec {
    // Trailing comma makes ansible read the inventory as a host list
    let mut cmd = CommandSpec::new("ansible-playbook").args(["-c", "chroot", "-i"]).arg(format!("{},", root));
    if let Some(extra) = &playbook.extra_vars {
        cmd = cmd.args(["-e", extra.as_str()]);
    }
    cmd.arg(format!("{}/{}", SOURCE_MOUNT_PATH, playbook.path.trim_start_matches('/')))
}
