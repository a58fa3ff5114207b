use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use crate::config::BuilderConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub package: String,
    pub architecture: String,
    pub version: String,
    /// Where the builder must leave the package's `.deb` files.
    pub artifact_dir: PathBuf,
}

/// External build step for one package. Retries, if any, belong here.
///
/// A timed-out build is abandoned, not joined: implementations that do not
/// go through `ExecCtx::run_cmd` must poll `ExecCtx::aborted` and stop once
/// it is set, or they keep running and may still write artifacts.
pub trait Builder: Send + Sync {
    fn build(&self, req: &BuildRequest, ctx: &ExecCtx) -> Result<()>;
}

/// Runs a command template per package (the default template drives
/// `docker buildx build`).
///
/// Placeholders: `{package}`, `{arch}`, `{version}`, `{artifacts}`, `{root}`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    root: PathBuf,
}

impl CommandBuilder {
    pub fn new(argv: Vec<String>, env: BTreeMap<String, String>, root: PathBuf) -> Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(Error::config("builder.command must name a program"));
        }
        Ok(Self { argv, env, root })
    }

    pub fn from_config(cfg: &BuilderConfig, root: PathBuf) -> Result<Self> {
        Self::new(cfg.command.clone(), cfg.env.clone(), root)
    }

    pub fn render(&self, req: &BuildRequest) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{package}", &req.package)
                    .replace("{arch}", &req.architecture)
                    .replace("{version}", &req.version)
                    .replace("{artifacts}", &req.artifact_dir.to_string_lossy())
                    .replace("{root}", &self.root.to_string_lossy())
            })
            .collect()
    }
}

impl Builder for CommandBuilder {
    fn build(&self, req: &BuildRequest, ctx: &ExecCtx) -> Result<()> {
        let argv = self.render(req);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::config("builder.command is empty"));
        };
        tracing::debug!(package = %req.package, command = ?argv, "invoking builder");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .envs(&self.env)
            .env("PITRAC_PACKAGE", &req.package)
            .env("PITRAC_VERSION", &req.version)
            .env("PITRAC_ARCH", &req.architecture);
        ctx.run_cmd(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> BuildRequest {
        BuildRequest {
            package: "opencv".into(),
            architecture: "arm64".into(),
            version: "4.11.0".into(),
            artifact_dir: PathBuf::from("/ws/out/arm64"),
        }
    }

    #[test]
    fn default_template_targets_buildx() {
        let b = CommandBuilder::from_config(&BuilderConfig::default(), PathBuf::from("/ws"))
            .expect("builder");
        let argv = b.render(&req());
        assert_eq!(&argv[..3], ["docker", "buildx", "build"]);
        assert!(argv.contains(&"linux/arm64".to_string()));
        assert!(argv.contains(&"VERSION=4.11.0".to_string()));
        assert!(argv.contains(&"/ws/packages/opencv/Dockerfile".to_string()));
        assert!(argv.contains(&"type=local,dest=/ws/out/arm64".to_string()));
    }

    #[test]
    fn rejects_empty_program() {
        assert!(CommandBuilder::new(vec![], BTreeMap::new(), PathBuf::from(".")).is_err());
        assert!(CommandBuilder::new(vec![" ".into()], BTreeMap::new(), PathBuf::from(".")).is_err());
    }
}
