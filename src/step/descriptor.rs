//! Steps driven by a manifest entry instead of hand-written code.

use super::download::DownloadDescriptor;
use super::probe::{Probe, all_hold};
use super::process::{ProcessResult, ProcessSpec, run_process};
use super::{Step, StepKind, StepOutcome};
use crate::errors::StepError;
use crate::manifest::{ExitClass, InvocationDescriptor, StepDefinition};
use crate::transcript::Transcript;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(60);
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Run-wide values a descriptor step falls back on.
#[derive(Debug, Clone)]
pub struct StepEnv {
    pub log_dir: PathBuf,
    pub download_dir: PathBuf,
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// A [`Step`] assembled from probes, a download and an installer invocation.
#[derive(Debug, Clone)]
pub struct DescriptorStep {
    def: StepDefinition,
    download_dir: PathBuf,
    max_attempts: u32,
    timeout: Duration,
    verify_timeout: Duration,
    transcript: Transcript,
}

impl DescriptorStep {
    pub fn new(def: StepDefinition, env: &StepEnv) -> Self {
        let transcript = Transcript::for_step(&env.log_dir, &def.id);
        Self {
            max_attempts: def.max_attempts.unwrap_or(env.max_attempts).max(1),
            timeout: def
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(env.timeout),
            verify_timeout: def
                .verify_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_VERIFY_TIMEOUT),
            download_dir: env.download_dir.clone(),
            transcript,
            def,
        }
    }

    /// Build one step per manifest entry, preserving declared order.
    pub fn from_definitions(defs: &[StepDefinition], env: &StepEnv) -> Vec<Box<dyn Step>> {
        defs.iter()
            .map(|def| Box::new(Self::new(def.clone(), env)) as Box<dyn Step>)
            .collect()
    }

    async fn download(&self, descriptor: &DownloadDescriptor) -> Result<PathBuf, StepError> {
        descriptor
            .fetch(&self.download_dir, Some(&self.transcript))
            .await
    }

    async fn install(
        &self,
        install: &InvocationDescriptor,
        payload: Option<&Path>,
    ) -> Result<StepOutcome, StepError> {
        let program = match payload {
            Some(path) => install
                .program
                .replace(crate::manifest::DOWNLOAD_PLACEHOLDER, &path.to_string_lossy()),
            None => install.program.clone(),
        };
        let mut spec = ProcessSpec::new(program, install.resolved_args(payload), self.timeout);
        spec.working_dir = install.working_dir.clone();

        match run_process(&spec, Some(&self.transcript)).await? {
            ProcessResult::TimedOut { after } => Ok(StepOutcome::failed(
                format!("{} timed out after {}s", spec.program, after.as_secs()),
                true,
            )),
            ProcessResult::Exited { code, .. } => Ok(match install.classify(code) {
                ExitClass::Success => StepOutcome::Success,
                ExitClass::RebootRequired => {
                    tracing::info!(step = %self.def.id, code, "installer requested a reboot");
                    StepOutcome::RebootRequired
                }
                ExitClass::Retryable => StepOutcome::failed(
                    format!("{} exited with retryable code {}", spec.program, code),
                    true,
                ),
                ExitClass::Failure => StepOutcome::failed(
                    format!("{} exited with code {}", spec.program, code),
                    false,
                ),
            }),
        }
    }

    /// Poll `probe` until it holds or the verify window closes.
    async fn verify(&self, probe: &Probe) -> Result<StepOutcome, StepError> {
        let deadline = Instant::now() + self.verify_timeout;
        loop {
            match probe.holds().await {
                Ok(true) => {
                    self.transcript
                        .append_line(&format!("verified: {}", probe.describe()));
                    return Ok(StepOutcome::Success);
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(step = %self.def.id, "verify probe error: {}", e),
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(VERIFY_POLL_INTERVAL.min(self.verify_timeout)).await;
        }
        self.transcript
            .append_line(&format!("verification failed: {}", probe.describe()));
        Ok(StepOutcome::failed(
            format!(
                "verification did not hold within {}s: {}",
                self.verify_timeout.as_secs(),
                probe.describe()
            ),
            true,
        ))
    }
}

#[async_trait]
impl Step for DescriptorStep {
    fn id(&self) -> &str {
        &self.def.id
    }

    fn kind(&self) -> StepKind {
        self.def.kind
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn requires_reboot_after(&self) -> bool {
        self.def.requires_reboot_after
    }

    fn optional(&self) -> bool {
        self.def.optional
    }

    async fn idempotent_check(&self) -> Result<bool, StepError> {
        if !self.def.check.is_empty() {
            return all_hold(&self.def.check).await;
        }
        match self.def.verify {
            Some(ref probe) => probe.holds().await,
            None => Ok(false),
        }
    }

    async fn execute(&self) -> Result<StepOutcome, StepError> {
        if let Some(ref probe) = self.def.skip_when
            && probe.holds().await?
        {
            let reason = format!("not applicable: {}", probe.describe());
            self.transcript.append_line(&reason);
            return Ok(StepOutcome::skipped(reason));
        }

        if let Some(ref install) = self.def.install {
            let payload = match self.def.download {
                Some(ref download) => Some(self.download(download).await?),
                None => None,
            };
            let outcome = self.install(install, payload.as_deref()).await?;
            if outcome != StepOutcome::Success {
                return Ok(outcome);
            }
        }

        if let Some(ref probe) = self.def.verify {
            return self.verify(probe).await;
        }

        // Detection only: nothing to apply, so the check is the result.
        if self.def.install.is_none() && !self.def.check.is_empty() {
            if all_hold(&self.def.check).await? {
                return Ok(StepOutcome::Success);
            }
            let described: Vec<String> = self.def.check.iter().map(Probe::describe).collect();
            return Err(StepError::permanent(format!(
                "detection failed: {}",
                described.join(", ")
            )));
        }

        Ok(StepOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn env(dir: &TempDir) -> StepEnv {
        StepEnv {
            log_dir: dir.path().join("logs"),
            download_dir: dir.path().join("downloads"),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }

    fn definition(toml_src: &str) -> StepDefinition {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_defaults_come_from_env() {
        let dir = tempdir().unwrap();
        let step = DescriptorStep::new(
            definition("id = \"a\"\ncheck = [{ type = \"path\", path = \"/\" }]"),
            &env(&dir),
        );
        assert_eq!(step.max_attempts(), 3);
        assert_eq!(step.timeout, Duration::from_secs(30));
        assert_eq!(step.kind(), StepKind::Install);
        assert!(step.transcript.path().ends_with("logs/a.log"));
    }

    #[tokio::test]
    async fn test_check_falls_back_to_verify_probe() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("done");
        let def = definition(&format!(
            "id = \"v\"\nkind = \"verify\"\nverify = {{ type = \"path\", path = '{}' }}",
            marker.display()
        ));
        let step = DescriptorStep::new(def, &env(&dir));
        assert!(!step.idempotent_check().await.unwrap());
        std::fs::write(&marker, "").unwrap();
        assert!(step.idempotent_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_no_check_and_no_verify_never_satisfied() {
        let dir = tempdir().unwrap();
        let step = DescriptorStep::new(
            definition("id = \"c\"\ninstall = { program = \"true\" }"),
            &env(&dir),
        );
        assert!(!step.idempotent_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_detect_only_step_fails_permanently() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        let def = definition(&format!(
            "id = \"detect\"\nkind = \"detect\"\ncheck = [{{ type = \"path\", path = '{}' }}]",
            missing.display()
        ));
        let step = DescriptorStep::new(def, &env(&dir));
        let err = step.execute().await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("detection failed"));
    }

    #[tokio::test]
    async fn test_skip_when_short_circuits() {
        let dir = tempdir().unwrap();
        let def = definition(&format!(
            "id = \"ec2-only\"\nskip_when = {{ type = \"path\", path = '{}' }}\ninstall = {{ program = \"definitely-not-installed-xyz\" }}",
            dir.path().display()
        ));
        let step = DescriptorStep::new(def, &env(&dir));
        let outcome = step.execute().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped { .. }));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        /// POSIX exit statuses are 8-bit, so the MSI codes are remapped here.
        fn sh_step(dir: &TempDir, script: &str) -> DescriptorStep {
            let def = definition(&format!(
                "id = \"sh\"\ninstall = {{ program = \"sh\", args = [\"-c\", \"{}\"], reboot_codes = [10], retryable_codes = [11] }}",
                script
            ));
            DescriptorStep::new(def, &env(dir))
        }

        #[tokio::test]
        async fn test_exit_codes_map_to_outcomes() {
            let dir = tempdir().unwrap();
            assert_eq!(sh_step(&dir, "exit 0").execute().await.unwrap(), StepOutcome::Success);
            assert_eq!(
                sh_step(&dir, "exit 10").execute().await.unwrap(),
                StepOutcome::RebootRequired
            );
            assert!(sh_step(&dir, "exit 11")
                .execute()
                .await
                .unwrap()
                .is_retryable_failure());
            let fatal = sh_step(&dir, "exit 12").execute().await.unwrap();
            assert!(fatal.is_failure());
            assert!(!fatal.is_retryable_failure());
        }

        #[tokio::test]
        async fn test_timeout_is_retryable() {
            let dir = tempdir().unwrap();
            let def = definition(
                "id = \"hang\"\ntimeout_secs = 1\ninstall = { program = \"sh\", args = [\"-c\", \"sleep 20\"] }",
            );
            let step = DescriptorStep::new(def, &env(&dir));
            let outcome = step.execute().await.unwrap();
            assert!(outcome.is_retryable_failure());
            assert!(outcome.reason().unwrap().contains("timed out"));
        }

        #[tokio::test]
        async fn test_download_then_install_with_placeholder() {
            let dir = tempdir().unwrap();
            let payload = dir.path().join("agent.sh");
            let marker = dir.path().join("installed");
            std::fs::write(&payload, format!("touch '{}'\n", marker.display())).unwrap();

            let def = definition(&format!(
                r#"
id = "agent"
download = {{ sources = ['{}'], sha256 = "{}" }}
install = {{ program = "sh", args = ["{{download}}"] }}
verify = {{ type = "path", path = '{}' }}
verify_timeout_secs = 1
"#,
                payload.display(),
                crate::step::download::sha256_file(&payload).unwrap(),
                marker.display()
            ));
            let step = DescriptorStep::new(def, &env(&dir));
            assert!(!step.idempotent_check().await.unwrap());
            assert_eq!(step.execute().await.unwrap(), StepOutcome::Success);
            assert!(step.idempotent_check().await.unwrap());
            assert!(dir.path().join("downloads/agent.sh").exists());

            let transcript = std::fs::read_to_string(step.transcript.path()).unwrap();
            assert!(transcript.contains("exit code 0"));
        }

        #[tokio::test]
        async fn test_failed_verification_is_retryable() {
            let dir = tempdir().unwrap();
            let def = definition(&format!(
                "id = \"svc\"\ninstall = {{ program = \"true\" }}\nverify = {{ type = \"path\", path = '{}' }}\nverify_timeout_secs = 0",
                dir.path().join("never").display()
            ));
            let step = DescriptorStep::new(def, &env(&dir));
            let outcome = step.execute().await.unwrap();
            assert!(outcome.is_retryable_failure());
        }
    }
}
