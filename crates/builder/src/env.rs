//! Builder environment parsing

use crds::contract::{
    DEFAULT_GIT_BRANCH, DEFAULT_OUTPUT_FILENAME, ENV_ANSIBLE_EXTRA_VARS, ENV_ARCHITECTURE, ENV_BASE_IMAGE,
    ENV_GIT_BRANCH, ENV_GIT_REPO, ENV_OUTPUT_FILENAME, ENV_OUTPUT_FORMATS, ENV_PLAYBOOK,
};
use crds::{Architecture, OutputFormat};

use crate::error::BuilderError;

/// Repository cloned into the source directory before provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepo {
    pub url: String,
    pub branch: String,
}

/// Playbook run against the container root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playbook {
    /// Path relative to the source directory
    pub path: String,
    /// JSON object handed to `-e`, validated but passed through verbatim
    pub extra_vars: Option<String>,
}

/// Everything the build sequence needs, read from the process environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderEnv {
    pub base_image: String,
    pub arch: Architecture,
    pub output_filename: String,
    pub formats: Vec<OutputFormat>,
    pub source: Option<SourceRepo>,
    pub playbook: Option<Playbook>,
}

impl BuilderEnv {
    /// Reads the builder environment of the current process
    pub fn from_env() -> Result<Self, BuilderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the builder environment through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BuilderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base_image = get(ENV_BASE_IMAGE).ok_or(BuilderError::MissingEnv(ENV_BASE_IMAGE))?;
        let arch = get(ENV_ARCHITECTURE)
            .ok_or(BuilderError::MissingEnv(ENV_ARCHITECTURE))?
            .parse::<Architecture>()
            .map_err(|e| BuilderError::InvalidEnv {
                name: ENV_ARCHITECTURE,
                reason: e.to_string(),
            })?;

        let formats = match get(ENV_OUTPUT_FORMATS) {
            Some(list) => parse_formats(&list)?,
            None => vec![OutputFormat::Tgz],
        };

        let source = get(ENV_GIT_REPO).map(|url| SourceRepo {
            url,
            branch: get(ENV_GIT_BRANCH).unwrap_or_else(|| DEFAULT_GIT_BRANCH.to_string()),
        });

        let playbook = match get(ENV_PLAYBOOK) {
            None => None,
            Some(_) if source.is_none() => {
                return Err(BuilderError::InvalidEnv {
                    name: ENV_PLAYBOOK,
                    reason: format!("set without {}", ENV_GIT_REPO),
                });
            }
            Some(path) if path.split('/').any(|c| c == "..") => {
                return Err(BuilderError::InvalidEnv {
                    name: ENV_PLAYBOOK,
                    reason: format!("{:?} leaves the source checkout", path),
                });
            }
            Some(path) => {
                let extra_vars = get(ENV_ANSIBLE_EXTRA_VARS);
                if let Some(raw) = &extra_vars {
                    serde_json::from_str::<serde_json::Value>(raw).map_err(|e| BuilderError::InvalidEnv {
                        name: ENV_ANSIBLE_EXTRA_VARS,
                        reason: e.to_string(),
                    })?;
                }
                Some(Playbook { path, extra_vars })
            }
        };

        Ok(Self {
            base_image,
            arch,
            output_filename: get(ENV_OUTPUT_FILENAME).unwrap_or_else(|| DEFAULT_OUTPUT_FILENAME.to_string()),
            formats,
            source,
            playbook,
        })
    }

    /// True when a qcow2 disk image should be produced
    pub fn wants_qcow2(&self) -> bool {
        self.formats.contains(&OutputFormat::Qcow2)
    }
}

fn parse_formats(list: &str) -> Result<Vec<OutputFormat>, BuilderError> {
    let mut formats = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let format = item.parse::<OutputFormat>().map_err(|e| BuilderError::InvalidEnv {
            name: ENV_OUTPUT_FORMATS,
            reason: e.to_string(),
        })?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    if formats.is_empty() {
        formats.push(OutputFormat::Tgz);
    }
    Ok(formats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_environment() {
        let env = BuilderEnv::from_lookup(lookup(&[("BASE_IMAGE", "ubuntu:24.04"), ("ARCHITECTURE", "arm64")])).unwrap();

        assert_eq!(env.base_image, "ubuntu:24.04");
        assert_eq!(env.arch, Architecture::Arm64);
        assert_eq!(env.output_filename, "rootfs");
        assert_eq!(env.formats, vec![OutputFormat::Tgz]);
        assert!(env.source.is_none());
        assert!(env.playbook.is_none());
        assert!(!env.wants_qcow2());
    }

    #[test]
    fn test_missing_required_variables() {
        let err = BuilderEnv::from_lookup(lookup(&[("ARCHITECTURE", "amd64")])).unwrap_err();
        assert!(matches!(err, BuilderError::MissingEnv("BASE_IMAGE")));

        let err = BuilderEnv::from_lookup(lookup(&[("BASE_IMAGE", "ubuntu:24.04"), ("ARCHITECTURE", " ")])).unwrap_err();
        assert!(matches!(err, BuilderError::MissingEnv("ARCHITECTURE")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = BuilderEnv::from_lookup(lookup(&[("BASE_IMAGE", "ubuntu:24.04"), ("ARCHITECTURE", "riscv64")]))
            .unwrap_err();
        assert!(matches!(err, BuilderError::InvalidEnv { name: "ARCHITECTURE", .. }));

        let err = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("OUTPUT_FORMATS", "tgz,vmdk"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BuilderError::InvalidEnv { name: "OUTPUT_FORMATS", .. }));
    }

    #[test]
    fn test_formats_deduplicated() {
        let env = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("OUTPUT_FORMATS", "qcow2, tgz,qcow2,"),
        ]))
        .unwrap();
        assert_eq!(env.formats, vec![OutputFormat::Qcow2, OutputFormat::Tgz]);
        assert!(env.wants_qcow2());
    }

    #[test]
    fn test_ansible_environment() {
        let env = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("OUTPUT_FILENAME", "my-image"),
            ("GIT_REPO", "https://github.com/org/playbooks"),
            ("PLAYBOOK", "site.yml"),
            ("ANSIBLE_EXTRA_VARS", r#"{"k8s_version":"1.30"}"#),
        ]))
        .unwrap();

        assert_eq!(env.output_filename, "my-image");
        assert_eq!(
            env.source,
            Some(SourceRepo {
                url: "https://github.com/org/playbooks".to_string(),
                branch: "main".to_string(),
            })
        );
        assert_eq!(
            env.playbook,
            Some(Playbook {
                path: "site.yml".to_string(),
                extra_vars: Some(r#"{"k8s_version":"1.30"}"#.to_string()),
            })
        );
    }

    #[test]
    fn test_playbook_requires_repository() {
        let err = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("PLAYBOOK", "site.yml"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BuilderError::InvalidEnv { name: "PLAYBOOK", .. }));
    }

    #[test]
    fn test_playbook_must_stay_inside_source() {
        for path in ["../../etc/evil.yml", "playbooks/../../x.yml", ".."] {
            let err = BuilderEnv::from_lookup(lookup(&[
                ("BASE_IMAGE", "ubuntu:24.04"),
                ("ARCHITECTURE", "amd64"),
                ("GIT_REPO", "https://github.com/org/playbooks"),
                ("PLAYBOOK", path),
            ]))
            .unwrap_err();
            assert!(matches!(err, BuilderError::InvalidEnv { name: "PLAYBOOK", .. }), "{path}");
        }

        let env = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("GIT_REPO", "https://github.com/org/playbooks"),
            ("PLAYBOOK", "playbooks/..site.yml"),
        ]))
        .unwrap();
        assert_eq!(env.playbook.unwrap().path, "playbooks/..site.yml");
    }

    #[test]
    fn test_extra_vars_must_be_json() {
        let err = BuilderEnv::from_lookup(lookup(&[
            ("BASE_IMAGE", "ubuntu:24.04"),
            ("ARCHITECTURE", "amd64"),
            ("GIT_REPO", "https://github.com/org/playbooks"),
            ("PLAYBOOK", "site.yml"),
            ("ANSIBLE_EXTRA_VARS", "k8s_version=1.30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BuilderError::InvalidEnv { name: "ANSIBLE_EXTRA_VARS", .. }));
    }
}
