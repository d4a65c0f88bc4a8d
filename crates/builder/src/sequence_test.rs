#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crds::{Architecture, OutputFormat};

    use crate::env::{BuilderEnv, Playbook, SourceRepo};
    use crate::error::BuilderError;
    use crate::runner::{CommandRunner, CommandSpec};
    use crate::sequence::run_build;

    const CONTAINER: &str = "ubuntu-working-container";
    const ROOT: &str = "/var/lib/containers/storage/overlay/abc/merged";
    const AUTH_FILE: &str = "/etc/baseimage-pull-secret/.dockerconfigjson";

    /// Records every command and fails the first one starting with `fail_on`
    #[derive(Default)]
    struct RecordingRunner {
        commands: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingRunner {
        fn failing_on(prefix: &'static str) -> Self {
            Self {
                fail_on: Some(prefix),
                ..Default::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &CommandSpec) -> Result<String, BuilderError> {
            let line = command.to_string();
            self.commands.lock().unwrap().push(line.clone());

            if self.fail_on.is_some_and(|prefix| line.starts_with(prefix)) {
                return Err(BuilderError::CommandFailed {
                    command: line,
                    status: "exit status: 2".to_string(),
                    stderr: "boom".to_string(),
                });
            }

            let output = match (command.program.as_str(), command.args.first().map(String::as_str)) {
                ("buildah", Some("from")) => format!("Getting image source signatures\n{}\n", CONTAINER),
                ("buildah", Some("mount")) => ROOT.to_string(),
                _ => String::new(),
            };
            Ok(output)
        }
    }

    fn plain_env() -> BuilderEnv {
        BuilderEnv {
            base_image: "ubuntu:24.04".to_string(),
            arch: Architecture::Amd64,
            output_filename: "rootfs".to_string(),
            formats: vec![OutputFormat::Tgz],
            source: None,
            playbook: None,
        }
    }

    fn ansible_env() -> BuilderEnv {
        BuilderEnv {
            output_filename: "my-image".to_string(),
            formats: vec![OutputFormat::Tgz, OutputFormat::Qcow2],
            source: Some(SourceRepo {
                url: "https://github.com/org/playbooks".to_string(),
                branch: "main".to_string(),
            }),
            playbook: Some(Playbook {
                path: "site.yml".to_string(),
                extra_vars: Some(r#"{"k8s_version":"1.30"}"#.to_string()),
            }),
            ..plain_env()
        }
    }

    #[tokio::test]
    async fn test_plain_build_command_order() {
        let runner = RecordingRunner::default();
        let artifacts = run_build(&runner, &plain_env(), None).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "buildah from --arch amd64 ubuntu:24.04".to_string(),
                format!("buildah mount {}", CONTAINER),
                format!("mount --bind /dev {}/dev", ROOT),
                format!("umount {}/dev", ROOT),
                format!("buildah umount {}", CONTAINER),
                format!("buildah mount {}", CONTAINER),
                format!("tar -czf /output/rootfs.tar.gz -C {} .", ROOT),
                format!("buildah umount {}", CONTAINER),
                format!("buildah rm {}", CONTAINER),
            ]
        );
        assert_eq!(artifacts.archive, "/output/rootfs.tar.gz");
        assert_eq!(artifacts.disk_image, None);
    }

    #[tokio::test]
    async fn test_provisioned_build_command_order() {
        let runner = RecordingRunner::default();
        let artifacts = run_build(&runner, &ansible_env(), Some(AUTH_FILE)).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                format!("buildah from --arch amd64 --authfile {} ubuntu:24.04", AUTH_FILE),
                format!("buildah mount {}", CONTAINER),
                format!("mount --bind /dev {}/dev", ROOT),
                "git clone --depth 1 --branch main https://github.com/org/playbooks /source".to_string(),
                format!(
                    r#"ansible-playbook -c chroot -i {}, -e {{"k8s_version":"1.30"}} /source/site.yml"#,
                    ROOT
                ),
                format!("umount {}/dev", ROOT),
                format!("buildah umount {}", CONTAINER),
                format!("buildah mount {}", CONTAINER),
                format!("tar -czf /output/my-image.tar.gz -C {} .", ROOT),
                "virt-make-fs --format=qcow2 --type=ext4 /output/my-image.tar.gz /output/my-image.qcow2".to_string(),
                format!("buildah umount {}", CONTAINER),
                format!("buildah rm {}", CONTAINER),
            ]
        );
        assert_eq!(artifacts.disk_image.as_deref(), Some("/output/my-image.qcow2"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_releases_device_mount() {
        let runner = RecordingRunner::failing_on("ansible-playbook");
        let err = run_build(&runner, &ansible_env(), None).await.unwrap_err();
        assert!(matches!(err, BuilderError::CommandFailed { .. }));

        let commands = runner.commands();
        assert!(commands.last().unwrap().starts_with("umount "));
        assert_eq!(commands.iter().filter(|c| c.starts_with("umount ")).count(), 1);
        // Nothing after the release: no archive and no container cleanup
        assert!(!commands.iter().any(|c| c.starts_with("tar ")));
        assert!(!commands.iter().any(|c| c.starts_with("buildah rm")));
    }

    #[tokio::test]
    async fn test_clone_failure_releases_device_mount() {
        let runner = RecordingRunner::failing_on("git clone");
        run_build(&runner, &ansible_env(), None).await.unwrap_err();

        let commands = runner.commands();
        assert!(!commands.iter().any(|c| c.starts_with("ansible-playbook")));
        assert_eq!(commands.last().unwrap(), &format!("umount {}/dev", ROOT));
    }

    #[tokio::test]
    async fn test_failure_before_bind_does_not_unmount() {
        for prefix in ["buildah from", "buildah mount", "mount --bind"] {
            let runner = RecordingRunner::failing_on(prefix);
            run_build(&runner, &ansible_env(), None).await.unwrap_err();

            let commands = runner.commands();
            assert!(commands.last().unwrap().starts_with(prefix), "{prefix}: {commands:?}");
            assert!(!commands.iter().any(|c| c.starts_with("umount ")), "{prefix}: {commands:?}");
        }
    }

    #[tokio::test]
    async fn test_archive_failure_aborts() {
        let runner = RecordingRunner::failing_on("tar ");
        run_build(&runner, &ansible_env(), None).await.unwrap_err();

        let commands = runner.commands();
        assert!(commands.last().unwrap().starts_with("tar "));
        assert!(!commands.iter().any(|c| c.starts_with("virt-make-fs")));
    }

    #[tokio::test]
    async fn test_empty_container_id_is_an_error() {
        struct SilentRunner;

        #[async_trait::async_trait]
        impl CommandRunner for SilentRunner {
            async fn run(&self, _command: &CommandSpec) -> Result<String, BuilderError> {
                Ok(String::new())
            }
        }

        let err = run_build(&SilentRunner, &plain_env(), None).await.unwrap_err();
        assert!(matches!(err, BuilderError::EmptyOutput(cmd) if cmd.starts_with("buildah from")));
    }
}
