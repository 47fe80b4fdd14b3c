//! On-disk layout of a managed service
//!
//! ```text
//! <opt>/<ns>_<svc>/build-release/<build>/...   extracted releases
//! <opt>/<ns>_<svc>/env-release/<env>/overwrite.env
//! <opt>/<ns>_<svc>/current -> build-release/<build>
//! <etc>/<ns>_<svc>/env     -> <opt>/<ns>_<svc>/env-release/<env>
//! <tmp>/<ns>_<svc>/artifact/<build>/<job>.release.tar.gz
//! <unit_dir>/<ns>_<svc>.service
//! ```

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::link::Link;
use crate::storage::settings::PathSettings;

pub const ENV_FILE_NAME: &str = "overwrite.env";
pub const ARCHIVE_FILE_NAME: &str = "release.tar.gz";

/// Paths for one service on one host
#[derive(Debug, Clone)]
pub struct ServiceLayout {
    /// `<ns>_<svc>`
    pub service_name: String,

    opt_dir: PathBuf,
    etc_dir: PathBuf,
    tmp_dir: PathBuf,
    unit_dir: PathBuf,
}

impl ServiceLayout {
    pub fn new(paths: &PathSettings, namespace: &str, service: &str) -> Self {
        Self {
            service_name: format!("{}_{}", namespace, service),
            opt_dir: paths.opt_dir.clone(),
            etc_dir: paths.etc_dir.clone(),
            tmp_dir: paths.tmp_dir.clone(),
            unit_dir: paths.unit_dir.clone(),
        }
    }

    /// `<ns>_<svc>.service`
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.service_name)
    }

    pub fn base_dir(&self) -> Dir {
        Dir::new(self.opt_dir.join(&self.service_name))
    }

    pub fn etc_dir(&self) -> Dir {
        Dir::new(self.etc_dir.join(&self.service_name))
    }

    pub fn unit_dir(&self) -> Dir {
        Dir::new(&self.unit_dir)
    }

    pub fn unit_file(&self) -> File {
        self.unit_dir().file(&self.unit_name())
    }

    pub fn build_release_dir(&self, build_version: u64) -> Dir {
        self.base_dir()
            .subdir("build-release")
            .subdir(&build_version.to_string())
    }

    /// Extraction staging directory next to the release it replaces, one
    /// per job so concurrent installs of the same build never share it
    pub fn build_staging_dir(&self, build_version: u64, job_id: &str) -> Dir {
        self.base_dir()
            .subdir("build-release")
            .subdir(&format!("{}.job-{}.tmp", build_version, job_id))
    }

    pub fn env_release_dir(&self, env_version: u64) -> Dir {
        self.base_dir()
            .subdir("env-release")
            .subdir(&env_version.to_string())
    }

    pub fn env_file(&self, env_version: u64) -> File {
        self.env_release_dir(env_version).file(ENV_FILE_NAME)
    }

    pub fn artifact_dir(&self, build_version: u64) -> Dir {
        Dir::new(self.tmp_dir.join(&self.service_name))
            .subdir("artifact")
            .subdir(&build_version.to_string())
    }

    /// Download target of one job
    pub fn archive_file(&self, build_version: u64, job_id: &str) -> File {
        self.artifact_dir(build_version)
            .file(&format!("{}.{}", job_id, ARCHIVE_FILE_NAME))
    }

    /// `current` link the unit's `ExecStart` resolves through
    pub fn current_link(&self) -> Link {
        Link::new(self.base_dir().path().join("current"))
    }

    /// `env` link the unit's `EnvironmentFile` resolves through
    pub fn env_link(&self) -> Link {
        Link::new(self.etc_dir().path().join("env"))
    }

    /// Path the unit reads its environment from
    pub fn env_link_file(&self) -> PathBuf {
        self.env_link().path().join(ENV_FILE_NAME)
    }

    /// Path the unit executes
    pub fn exec_path(&self, executable_path: &str) -> PathBuf {
        self.current_link()
            .path()
            .join(executable_path.trim_start_matches('/'))
    }
}
