//! Compiling a strategy into a sandboxed build plan.
//!
//! A plan is an OCI-compatible build script: a Dockerfile plus ordered worker
//! steps that fetch tools, check out the pinned source, run the ecosystem
//! recipe, and upload the rebuilt artifact and build-info JSON through the
//! asset-store upload helper.

use rebuildr_schema::strategy::Strategy;
use rebuildr_schema::{Ecosystem, Target};
use std::time::Duration;

use crate::assets::{asset_path, Asset, AssetKind};
use crate::errors::{RebuildError, RebuildResult};

/// URLs of the helper tools staged in the prebuild bucket.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolUrls {
    /// The deterministic-time registry shim
    pub timewarp: String,
    /// The asset-store upload helper
    pub uploader: String,
}

impl Default for ToolUrls {
    fn default() -> Self {
        ToolUrls {
            timewarp: "https://prebuild.rebuildr.dev/tools/timewarp".to_owned(),
            uploader: "https://prebuild.rebuildr.dev/tools/asset-upload".to_owned(),
        }
    }
}

/// Base image the build container starts from.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BaseImage {
    /// Image reference
    pub image: String,
    /// Pinned digest
    pub digest: String,
}

impl Default for BaseImage {
    fn default() -> Self {
        BaseImage {
            image: "docker.io/library/debian:12".to_owned(),
            digest: "sha256:6d15c01b0bf0a7b2ebaa3c31a7b7b68cb5de3b4928bee9f4f1a1e61e839e25eb"
                .to_owned(),
        }
    }
}

/// Caller-facing knobs for one remote build.
#[derive(Debug, Clone)]
pub struct RemoteBuildOptions {
    /// Hard build timeout enforced by the worker
    pub timeout: Duration,
    /// Whether to route egress through the network proxy
    pub use_network_proxy: bool,
    /// Whether to run the syscall monitor alongside the build
    pub use_syscall_monitor: bool,
    /// Whether to persist the post-build container image
    pub preserve_image: bool,
    /// Tool URLs the build consumes
    pub tool_urls: ToolUrls,
    /// Whether tool fetches need the prebuild bucket auth header
    pub prebuild_auth: bool,
    /// Base image configuration
    pub base_image: BaseImage,
    /// Base URI the worker uploads assets under
    pub upload_base: String,
}

impl Default for RemoteBuildOptions {
    fn default() -> Self {
        RemoteBuildOptions {
            timeout: Duration::from_secs(15 * 60),
            use_network_proxy: false,
            use_syscall_monitor: false,
            preserve_image: false,
            tool_urls: ToolUrls::default(),
            prebuild_auth: false,
            base_image: BaseImage::default(),
            upload_base: String::new(),
        }
    }
}

/// One ordered step the worker runs inside the build container.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerStep {
    /// Step name, for logs
    pub name: String,
    /// Shell script body
    pub script: String,
}

/// A compiled build plan.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuildPlan {
    /// The container the steps run in
    pub dockerfile: String,
    /// Ordered steps
    pub steps: Vec<WorkerStep>,
    /// Hard timeout
    pub timeout_secs: u64,
    /// Whether egress goes through the proxy
    pub use_network_proxy: bool,
    /// Whether the syscall monitor runs
    pub use_syscall_monitor: bool,
    /// Whether the post-build image is kept
    pub preserve_image: bool,
}

/// Whether a strategy's tooling reads the wall clock and therefore needs the
/// registry view pinned to publish time.
pub fn uses_timewarp(strategy: &Strategy) -> bool {
    matches!(
        strategy,
        Strategy::NpmPackBuild(_) | Strategy::PypiWheelBuild(_) | Strategy::CratesioCargoPackage(_)
    )
}

fn ecosystem_packages(ecosystem: Ecosystem) -> &'static str {
    match ecosystem {
        Ecosystem::Npm => "git curl ca-certificates nodejs npm",
        Ecosystem::Pypi => "git curl ca-certificates python3 python3-pip python3-venv",
        Ecosystem::Cratesio => "git curl ca-certificates build-essential rustup",
        Ecosystem::Debian => "curl ca-certificates devscripts dpkg-dev build-essential fakeroot",
        Ecosystem::Maven => "git curl ca-certificates maven",
    }
}

fn recipe_script(target: &Target, strategy: &Strategy) -> RebuildResult<String> {
    let mut lines: Vec<String> = Vec::new();
    match strategy {
        Strategy::LocationHint(_) => {
            return Err(RebuildError::invalid_argument(
                "location hint is not buildable; run inference first",
            ))
        }
        Strategy::NpmPackBuild(build) => {
            lines.push(format!("npm install -g npm@{}", build.npm_version));
            if !build.location.dir.is_empty() {
                lines.push(format!("cd {}", build.location.dir));
            }
            lines.push("npm pack".to_owned());
            lines.push(format!("mv *.tgz /out/{}", target.artifact));
        }
        Strategy::PypiWheelBuild(build) => {
            lines.push("python3 -m venv /build-venv && . /build-venv/bin/activate".to_owned());
            if !build.requirements.is_empty() {
                lines.push(format!(
                    "pip install {}",
                    shell_quote_all(&build.requirements)
                ));
            }
            if !build.location.dir.is_empty() {
                lines.push(format!("cd {}", build.location.dir));
            }
            lines.push("python3 -m build --wheel --outdir /out".to_owned());
        }
        Strategy::CratesioCargoPackage(build) => {
            lines.push(format!(
                "rustup toolchain install {v} && rustup default {v}",
                v = build.rust_version
            ));
            if !build.location.dir.is_empty() {
                lines.push(format!("cd {}", build.location.dir));
            }
            lines.push("cargo package --no-verify --allow-dirty".to_owned());
            lines.push(format!(
                "mv target/package/{}-{}.crate /out/{}",
                target.package, target.version, target.artifact
            ));
        }
        Strategy::DebianPackage(build) => {
            let dsc = build
                .dsc
                .as_ref()
                .ok_or_else(|| RebuildError::invalid_argument("debian strategy without dsc"))?;
            lines.push(format!("curl -fsSLO {}", dsc.url));
            if let Some(orig) = &build.orig {
                lines.push(format!("curl -fsSLO {}", orig.url));
            }
            if let Some(debian) = &build.debian {
                lines.push(format!("curl -fsSLO {}", debian.url));
            }
            lines.push("dpkg-source -x *.dsc pkg && cd pkg".to_owned());
            lines.push("dpkg-buildpackage -b -uc -us".to_owned());
            lines.push(format!("mv ../{} /out/{}", target.artifact, target.artifact));
        }
        Strategy::MavenBuild(build) => {
            if !build.location.dir.is_empty() {
                lines.push(format!("cd {}", build.location.dir));
            }
            lines.push(format!(
                "mvn -q package -DskipTests -Dmaven.compiler.release={}",
                build.jdk_version
            ));
            lines.push(format!("mv target/{} /out/{}", target.artifact, target.artifact));
        }
        Strategy::Manual(build) => {
            if !build.deps.is_empty() {
                lines.push(build.deps.clone());
            }
            if !build.location.dir.is_empty() {
                lines.push(format!("cd {}", build.location.dir));
            }
            lines.push(build.build.clone());
            lines.push(format!("mv {} /out/{}", build.output_path, target.artifact));
        }
        Strategy::Workflow(build) => {
            for step in build
                .source_setup
                .iter()
                .chain(&build.deps)
                .chain(&build.build)
            {
                if let Some(uses) = &step.uses {
                    lines.push(format!("/tools/{uses} {}", format_with(&step.with)));
                } else {
                    lines.push(step.runs.clone());
                }
            }
            lines.push(format!("mv {} /out/{}", build.output_path, target.artifact));
        }
    }
    Ok(lines.join("\n"))
}

fn format_with(with: &std::collections::BTreeMap<String, String>) -> String {
    with.iter()
        .map(|(k, v)| format!("--{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote_all(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("'{}'", a.replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compile `(target, strategy, options)` into a plan.
pub fn generate_plan(
    target: &Target,
    strategy: &Strategy,
    options: &RemoteBuildOptions,
) -> RebuildResult<BuildPlan> {
    let location = strategy.location();
    let mut steps = Vec::new();

    let auth = if options.prebuild_auth {
        " -H \"Authorization: Bearer $PREBUILD_TOKEN\""
    } else {
        ""
    };
    let mut fetch_tools = format!(
        "mkdir -p /tools /out /src\ncurl -fsSL{auth} -o /tools/asset-upload {}\nchmod +x /tools/asset-upload",
        options.tool_urls.uploader
    );
    let timewarp = uses_timewarp(strategy).then(|| strategy.registry_time()).flatten();
    if timewarp.is_some() {
        fetch_tools.push_str(&format!(
            "\ncurl -fsSL{auth} -o /tools/timewarp {}\nchmod +x /tools/timewarp",
            options.tool_urls.timewarp
        ));
    }
    steps.push(WorkerStep {
        name: "fetch-tools".to_owned(),
        script: fetch_tools,
    });

    if let Some(pinned) = timewarp {
        steps.push(WorkerStep {
            name: "start-timewarp".to_owned(),
            script: format!(
                "/tools/timewarp --port 8081 --time {} &\nexport REGISTRY_SNAPSHOT=http://localhost:8081",
                pinned.to_rfc3339()
            ),
        });
    }

    if !matches!(strategy, Strategy::DebianPackage(_)) {
        steps.push(WorkerStep {
            name: "checkout-source".to_owned(),
            script: format!(
                "git clone {} /src\ncd /src\ngit checkout --detach {}",
                location.repo, location.git_ref
            ),
        });
    }

    steps.push(WorkerStep {
        name: "build".to_owned(),
        script: format!("cd /src\n{}", recipe_script(target, strategy)?),
    });

    let artifact_key = asset_path(&Asset::new(AssetKind::RebuiltArtifact, target.clone()));
    let info_key = asset_path(&Asset::new(AssetKind::BuildInfo, target.clone()));
    steps.push(WorkerStep {
        name: "upload-artifact".to_owned(),
        script: format!(
            "/tools/asset-upload /out/{artifact} {base}/{artifact_key}\n/tools/asset-upload /out/info.json {base}/{info_key}",
            artifact = target.artifact,
            base = options.upload_base,
        ),
    });

    if options.use_syscall_monitor || options.use_network_proxy {
        let mut script = String::new();
        if options.use_syscall_monitor {
            let key = asset_path(&Asset::new(AssetKind::TetragonLog, target.clone()));
            script.push_str(&format!(
                "/tools/asset-upload /var/log/tetragon.jsonl {}/{key}\n",
                options.upload_base
            ));
        }
        if options.use_network_proxy {
            let key = asset_path(&Asset::new(AssetKind::NetworkLog, target.clone()));
            script.push_str(&format!(
                "/tools/asset-upload /var/log/proxy/netlog.json {}/{key}\n",
                options.upload_base
            ));
        }
        steps.push(WorkerStep {
            name: "upload-build-logs".to_owned(),
            script,
        });
    }

    let dockerfile = format!(
        "FROM {}@{}\nENV DEBIAN_FRONTEND=noninteractive\nRUN apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*\nWORKDIR /src\n",
        options.base_image.image,
        options.base_image.digest,
        ecosystem_packages(target.ecosystem),
    );

    Ok(BuildPlan {
        dockerfile,
        steps,
        timeout_secs: options.timeout.as_secs(),
        use_network_proxy: options.use_network_proxy,
        use_syscall_monitor: options.use_syscall_monitor,
        preserve_image: options.preserve_image,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuildr_schema::strategy::{CratesioCargoPackage, NpmPackBuild};
    use rebuildr_schema::Location;

    fn npm_strategy() -> Strategy {
        Strategy::NpmPackBuild(NpmPackBuild {
            location: Location {
                repo: "https://github.com/stevemao/left-pad".to_owned(),
                git_ref: "9cbb52d40b2dea957b6b55d1b38ea3e211e69fe4".to_owned(),
                dir: String::new(),
            },
            npm_version: "10.8.2".to_owned(),
            registry_time: Some("2018-04-10T20:16:10Z".parse().unwrap()),
        })
    }

    #[test]
    fn npm_plan_shape() {
        let target = Target::new(
            Ecosystem::Npm,
            "left-pad",
            "1.3.0",
            "left-pad-1.3.0.tgz",
        )
        .unwrap();
        let options = RemoteBuildOptions {
            upload_base: "https://metadata.rebuildr.dev/bucket".to_owned(),
            use_syscall_monitor: true,
            ..Default::default()
        };
        let plan = generate_plan(&target, &npm_strategy(), &options).unwrap();

        insta::assert_snapshot!(plan.dockerfile, @r"
        FROM docker.io/library/debian:12@sha256:6d15c01b0bf0a7b2ebaa3c31a7b7b68cb5de3b4928bee9f4f1a1e61e839e25eb
        ENV DEBIAN_FRONTEND=noninteractive
        RUN apt-get update && apt-get install -y --no-install-recommends git curl ca-certificates nodejs npm && rm -rf /var/lib/apt/lists/*
        WORKDIR /src
        ");

        let names: Vec<_> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fetch-tools",
                "start-timewarp",
                "checkout-source",
                "build",
                "upload-artifact",
                "upload-build-logs",
            ]
        );
        let build = &plan.steps[3].script;
        assert!(build.contains("npm install -g npm@10.8.2"));
        assert!(build.contains("npm pack"));
        // the executor and verifier must agree on this path
        assert!(plan.steps[4].script.contains(
            "https://metadata.rebuildr.dev/bucket/npm/left-pad/1.3.0/left-pad-1.3.0.tgz/left-pad-1.3.0.tgz"
        ));
        assert!(plan.steps[1].script.contains("2018-04-10T20:16:10+00:00"));
    }

    #[test]
    fn timewarp_only_for_clocked_ecosystems() {
        assert!(uses_timewarp(&npm_strategy()));
        let maven = Strategy::MavenBuild(rebuildr_schema::strategy::MavenBuild {
            location: Location::default(),
            jdk_version: "17".to_owned(),
        });
        assert!(!uses_timewarp(&maven));

        let crate_build = Strategy::CratesioCargoPackage(CratesioCargoPackage {
            location: Location::default(),
            rust_version: "1.77.0".to_owned(),
            registry_time: None,
        });
        // clocked ecosystem, but nothing to pin to without a publish time
        let target = Target::new(
            Ecosystem::Cratesio,
            "serde",
            "1.0.200",
            "serde-1.0.200.crate",
        )
        .unwrap();
        let plan =
            generate_plan(&target, &crate_build, &RemoteBuildOptions::default()).unwrap();
        assert!(!plan.steps.iter().any(|s| s.name == "start-timewarp"));
    }

    #[test]
    fn location_hint_is_not_buildable() {
        let target =
            Target::new(Ecosystem::Npm, "left-pad", "1.3.0", "left-pad-1.3.0.tgz").unwrap();
        let hint = Strategy::LocationHint(Location::default());
        assert!(generate_plan(&target, &hint, &RemoteBuildOptions::default()).is_err());
    }

}
