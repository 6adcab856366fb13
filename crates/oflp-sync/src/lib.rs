//! Run orchestration for OFLP: environment configuration, domain
//! registry, harvest-and-cache pipeline, run manifest, scoped cleanup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use oflp_harvest::{builtin_domains, DatasetDomain, Harvester, DEFAULT_MAX_RECORDS, DEFAULT_PAGE_SIZE};
use oflp_storage::{CacheOutcome, DatasetCache, HttpClientConfig, HttpFetcher, PageFetcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oflp-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub base_url: String,
    pub artifacts_dir: PathBuf,
    pub pipeline_path: PathBuf,
    pub http_timeout_secs: u64,
    pub max_records: usize,
    pub cleanup_on_exit: bool,
    pub domains_path: Option<PathBuf>,
    pub user_agent: String,
}

impl SyncConfig {
    /// Reads configuration from the environment. The API key is required
    /// and its absence aborts the run before any network activity.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENFEMA_API_KEY")
            .context("OPENFEMA_API_KEY not found in environment variables")?;
        if api_key.trim().is_empty() {
            bail!("OPENFEMA_API_KEY is set but empty");
        }

        Ok(Self {
            api_key,
            base_url: std::env::var("OPENFEMA_BASE_URL")
                .unwrap_or_else(|_| "https://www.fema.gov/api/open".to_string()),
            artifacts_dir: std::env::var("OFLP_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            pipeline_path: pipeline_path_from_env(),
            http_timeout_secs: std::env::var("OFLP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_records: std::env::var("OFLP_MAX_RECORDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RECORDS),
            cleanup_on_exit: std::env::var("OFLP_CLEANUP_ON_EXIT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            domains_path: std::env::var("OFLP_DOMAINS_PATH").ok().map(PathBuf::from),
            user_agent: std::env::var("OFLP_USER_AGENT")
                .unwrap_or_else(|_| "oflp-bot/0.1".to_string()),
        })
    }
}

/// The pipeline document path is also needed by commands that never touch
/// the network, so it resolves independently of the full config.
pub fn pipeline_path_from_env() -> PathBuf {
    std::env::var("OFLP_PIPELINE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./pipeline.json"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainRegistry {
    pub domains: Vec<DatasetDomain>,
}

/// Built-in domains unless `OFLP_DOMAINS_PATH` points at a YAML registry.
pub async fn load_domains(config: &SyncConfig) -> Result<Vec<DatasetDomain>> {
    match &config.domains_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let registry: DomainRegistry = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(registry.domains)
        }
        None => Ok(builtin_domains()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainOutcome {
    pub domain_id: String,
    pub artifact: String,
    pub cache_hit: bool,
    pub records_written: usize,
    /// False when the harvest was truncated by a failed page call; the
    /// artifact then holds a partial record set.
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domains: Vec<DomainOutcome>,
    pub manifest_path: String,
    pub cleaned_artifacts: Vec<String>,
}

impl RunSummary {
    pub fn cache_hits(&self) -> usize {
        self.domains.iter().filter(|d| d.cache_hit).count()
    }

    pub fn records_written(&self) -> usize {
        self.domains.iter().map(|d| d.records_written).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactManifest {
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub domain_id: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Per-run harvest-and-cache pipeline. Each enabled dataset domain is
/// independent (disjoint artifact path, disjoint remote entity) and runs
/// sequentially. Transport failures are absorbed inside the harvester, so
/// a truncated domain does not stop the others; cache I/O errors are
/// surfaced and end the run.
pub struct HarvestPipeline {
    config: SyncConfig,
    domains: Vec<DatasetDomain>,
    cache: DatasetCache,
    fetcher: Box<dyn PageFetcher>,
}

impl HarvestPipeline {
    pub fn new(config: SyncConfig, domains: Vec<DatasetDomain>, fetcher: Box<dyn PageFetcher>) -> Self {
        Self {
            config,
            domains,
            cache: DatasetCache,
            fetcher,
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let domains = load_domains(&config).await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            api_key: Some(config.api_key.clone()),
        })?;
        Ok(Self::new(config, domains, Box::new(fetcher)))
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let harvester = Harvester {
            page_size: DEFAULT_PAGE_SIZE,
            max_records: self.config.max_records,
        };

        let mut outcomes = Vec::new();
        for domain in self.domains.iter().filter(|d| d.enabled) {
            let query = domain
                .query(&self.config.base_url, DEFAULT_PAGE_SIZE as u32)
                .to_query_string();
            let artifact_path = self.config.artifacts_dir.join(&domain.artifact_name);
            let entity = domain.entity.clone();
            let complete = AtomicBool::new(true);

            let outcome = self
                .cache
                .ensure(&artifact_path, || async {
                    let result = harvester
                        .harvest(self.fetcher.as_ref(), &query, &entity)
                        .await;
                    complete.store(result.complete, Ordering::Relaxed);
                    Ok(result.records)
                })
                .await
                .with_context(|| format!("ensuring artifact for domain {}", domain.domain_id))?;

            let (cache_hit, records_written) = match outcome {
                CacheOutcome::Hit => (true, 0),
                CacheOutcome::Written { records } => (false, records),
            };
            let complete = complete.load(Ordering::Relaxed);
            if !complete {
                warn!(
                    domain = %domain.domain_id,
                    "harvest was truncated; cached artifact holds a partial record set"
                );
            }
            outcomes.push(DomainOutcome {
                domain_id: domain.domain_id.clone(),
                artifact: artifact_path.display().to_string(),
                cache_hit,
                records_written,
                complete,
            });
        }

        let manifest_path = self.write_manifest(run_id, &outcomes).await?;

        // Scoped teardown, never an implicit global exit hook.
        let cleaned_artifacts = if self.config.cleanup_on_exit {
            self.cleanup_artifacts()
                .await?
                .iter()
                .map(|p| p.display().to_string())
                .collect()
        } else {
            Vec::new()
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            domains: outcomes,
            manifest_path: manifest_path.display().to_string(),
            cleaned_artifacts,
        };
        let summary_path = self
            .config
            .artifacts_dir
            .join(format!("run-{run_id}.json"));
        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        fs::write(&summary_path, bytes)
            .await
            .with_context(|| format!("writing {}", summary_path.display()))?;
        info!(%run_id, domains = summary.domains.len(), "run complete");
        Ok(summary)
    }

    /// Removes the enabled domains' cache artifacts so the next run starts
    /// from a cold cache. Returns the paths actually removed.
    pub async fn cleanup_artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for domain in self.domains.iter().filter(|d| d.enabled) {
            let path = self.config.artifacts_dir.join(&domain.artifact_name);
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "cache artifact removed");
                    removed.push(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing cache artifact {}", path.display()));
                }
            }
        }
        Ok(removed)
    }

    async fn write_manifest(&self, run_id: Uuid, outcomes: &[DomainOutcome]) -> Result<PathBuf> {
        let mut files = Vec::new();
        for outcome in outcomes {
            let bytes = fs::read(&outcome.artifact)
                .await
                .with_context(|| format!("reading {}", outcome.artifact))?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            files.push(ManifestFile {
                domain_id: outcome.domain_id.clone(),
                path: outcome.artifact.clone(),
                sha256: hex::encode(hasher.finalize()),
                bytes: bytes.len() as u64,
            });
        }

        let manifest = ArtifactManifest { run_id, files };
        let path = self
            .config
            .artifacts_dir
            .join(format!("manifest-{run_id}.json"));
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing artifact manifest")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Convenience entry point for the CLI: env config, registry, one run.
pub async fn run_harvest_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = HarvestPipeline::from_config(config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oflp_storage::FetchError;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn entity_of(url: &str) -> String {
        url.split('/')
            .nth(6)
            .and_then(|segment| segment.split('?').next())
            .unwrap_or_default()
            .to_string()
    }

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for CountingFetcher {
        async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Every entity answers with one short page of two records.
            let entity = entity_of(url);
            Ok(json!({
                entity: [
                    {"applicantName": "Wake County", "federalShareObligated": 150000.0},
                    {"applicantName": "Travis County", "federalShareObligated": 98000.0},
                ]
            }))
        }
    }

    /// Serves one full page for the hazard mitigation entity and fails its
    /// second page; every other entity answers with one short page.
    struct TruncatingFetcher {
        hma_calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for TruncatingFetcher {
        async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
            let entity = entity_of(url);
            if entity == "HazardMitigationAssistanceProjects" {
                if self.hma_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    let records: Vec<JsonValue> = (0..DEFAULT_PAGE_SIZE)
                        .map(|i| json!({"recipient": format!("Recipient {i}"), "state": "Texas"}))
                        .collect();
                    return Ok(json!({ entity: records }));
                }
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            Ok(json!({ entity: [{"state": "Texas"}] }))
        }
    }

    fn test_config(artifacts_dir: PathBuf, cleanup_on_exit: bool) -> SyncConfig {
        SyncConfig {
            api_key: "test-key".to_string(),
            base_url: "https://www.fema.gov/api/open".to_string(),
            pipeline_path: artifacts_dir.join("pipeline.json"),
            artifacts_dir,
            http_timeout_secs: 5,
            max_records: 1000,
            cleanup_on_exit,
            domains_path: None,
            user_agent: "oflp-test/0".to_string(),
        }
    }

    struct SharedFetcher(std::sync::Arc<CountingFetcher>);

    #[async_trait]
    impl PageFetcher for SharedFetcher {
        async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
            self.0.fetch_json(url).await
        }
    }

    fn test_pipeline(config: SyncConfig) -> (HarvestPipeline, std::sync::Arc<CountingFetcher>) {
        let fetcher = std::sync::Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let pipeline = HarvestPipeline::new(
            config,
            builtin_domains(),
            Box::new(SharedFetcher(fetcher.clone())),
        );
        (pipeline, fetcher)
    }

    #[tokio::test]
    async fn run_once_writes_one_artifact_per_domain() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path().to_path_buf(), false);
        let (pipeline, fetcher) = test_pipeline(config);

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.domains.len(), 3);
        assert_eq!(summary.cache_hits(), 0);
        assert_eq!(summary.records_written(), 6);
        assert!(summary.domains.iter().all(|d| d.complete));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        for name in [
            "processed_pa_data.json",
            "processed_hm_data.json",
            "processed_preparedness_data.json",
        ] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
    }

    #[tokio::test]
    async fn truncated_domain_writes_partial_artifact_and_flags_incomplete() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path().to_path_buf(), false);
        let pipeline = HarvestPipeline::new(
            config,
            builtin_domains(),
            Box::new(TruncatingFetcher {
                hma_calls: AtomicUsize::new(0),
            }),
        );

        let summary = pipeline.run_once().await.expect("run survives truncation");

        let hma = summary
            .domains
            .iter()
            .find(|d| d.domain_id == "hma")
            .expect("hma outcome");
        assert!(!hma.complete);
        assert_eq!(hma.records_written, DEFAULT_PAGE_SIZE);

        // The partial record set is still cached as a valid artifact.
        let artifact = std::fs::read_to_string(dir.path().join("processed_hm_data.json"))
            .expect("artifact written");
        let records: Vec<JsonValue> = serde_json::from_str(&artifact).expect("json array");
        assert_eq!(records.len(), DEFAULT_PAGE_SIZE);

        // The other domains are unaffected by the truncated one.
        for outcome in summary.domains.iter().filter(|d| d.domain_id != "hma") {
            assert!(outcome.complete, "{} should be complete", outcome.domain_id);
            assert_eq!(outcome.records_written, 1);
        }
    }

    #[tokio::test]
    async fn cache_write_error_ends_the_run() {
        let dir = tempdir().expect("tempdir");
        // A regular file where the artifacts directory should be makes
        // every artifact write fail.
        let blocked = dir.path().join("artifacts");
        std::fs::write(&blocked, b"not a directory").expect("write blocker");
        let config = test_config(blocked, false);
        let (pipeline, _) = test_pipeline(config);

        let err = pipeline.run_once().await.expect_err("cache error surfaces");
        assert!(err.to_string().contains("ensuring artifact for domain"));
    }

    #[tokio::test]
    async fn second_run_is_all_cache_hits() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path().to_path_buf(), false);
        let (pipeline, fetcher) = test_pipeline(config);

        pipeline.run_once().await.expect("first run");
        let calls_after_first = fetcher.calls.load(Ordering::SeqCst);
        let summary = pipeline.run_once().await.expect("second run");

        assert_eq!(summary.cache_hits(), 3);
        assert_eq!(summary.records_written(), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn manifest_lists_every_domain_artifact() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path().to_path_buf(), false);
        let (pipeline, _) = test_pipeline(config);

        let summary = pipeline.run_once().await.expect("run");
        let manifest_raw =
            std::fs::read_to_string(&summary.manifest_path).expect("manifest readable");
        let manifest: JsonValue = serde_json::from_str(&manifest_raw).expect("manifest json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 3);
        for file in files {
            assert_eq!(file["sha256"].as_str().map(str::len), Some(64));
            assert!(file["bytes"].as_u64().unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn cleanup_on_exit_removes_domain_artifacts() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path().to_path_buf(), true);
        let (pipeline, _) = test_pipeline(config);

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.cleaned_artifacts.len(), 3);
        assert!(!dir.path().join("processed_pa_data.json").exists());
        // manifest and run summary survive the teardown
        assert!(std::path::Path::new(&summary.manifest_path).exists());
    }

    #[tokio::test]
    async fn yaml_registry_overrides_builtin_domains() {
        let dir = tempdir().expect("tempdir");
        let registry_path = dir.path().join("domains.yaml");
        std::fs::write(
            &registry_path,
            r#"
domains:
  - domain_id: cayg
    display_name: Public Assistance deliveries
    enabled: false
    version: v1
    entity: PublicAssistanceApplicantsProgramDeliveries
    select: [stateCode, applicantName]
    state_field: stateCode
    states: [NC]
    non_zero_field: federalShareObligated
    artifact_name: processed_pa_data.json
"#,
        )
        .expect("write registry");

        let mut config = test_config(dir.path().to_path_buf(), false);
        config.domains_path = Some(registry_path);
        let domains = load_domains(&config).await.expect("load");
        assert_eq!(domains.len(), 1);
        assert!(!domains[0].enabled);
        assert_eq!(domains[0].states, vec!["NC".to_string()]);
    }

    #[test]
    fn config_requires_api_key() {
        // Serialized within one test; from_env is process-global.
        std::env::remove_var("OPENFEMA_API_KEY");
        let err = SyncConfig::from_env().expect_err("missing key must fail");
        assert!(err.to_string().contains("OPENFEMA_API_KEY"));

        std::env::set_var("OPENFEMA_API_KEY", "  ");
        assert!(SyncConfig::from_env().is_err());

        std::env::set_var("OPENFEMA_API_KEY", "demo-key");
        let config = SyncConfig::from_env().expect("key present");
        assert_eq!(config.api_key, "demo-key");
        assert_eq!(config.base_url, "https://www.fema.gov/api/open");
        std::env::remove_var("OPENFEMA_API_KEY");
    }
}
