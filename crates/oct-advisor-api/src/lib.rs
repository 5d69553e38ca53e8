use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use oct_advisor_core::{
    builtin_knowledge_base, ConfigurationError, Guardrail, KnowledgeBase, Outcome, Paper, Query,
    Response, Rule, SynthesisEngine,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

/// Environment variable naming a knowledge file to load instead of the builtin base.
pub const KNOWLEDGE_BASE_ENV: &str = "OCT_ADVISOR_KNOWLEDGE_BASE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PaperEntry {
    pub key: String,
    pub title: String,
    pub author: String,
    pub year: u16,
    #[serde(default)]
    pub relevance: String,
}

/// On-disk knowledge base. YAML and JSON are both accepted when loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeFile {
    #[serde(default)]
    pub papers: Vec<PaperEntry>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl KnowledgeFile {
    #[must_use]
    pub fn from_knowledge_base(base: &KnowledgeBase) -> Self {
        Self {
            papers: base
                .papers()
                .iter()
                .map(|(key, paper)| PaperEntry {
                    key: key.clone(),
                    title: paper.title.clone(),
                    author: paper.author.clone(),
                    year: paper.year,
                    relevance: paper.relevance.clone(),
                })
                .collect(),
            rules: base.rules().to_vec(),
        }
    }

    /// Validate the file contents into a knowledge base.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] for repeated paper keys or any knowledge base
    /// invariant violation.
    pub fn into_knowledge_base(self) -> Result<KnowledgeBase, ConfigurationError> {
        let papers = self
            .papers
            .into_iter()
            .map(|entry| {
                (entry.key, Paper {
                    title: entry.title,
                    author: entry.author,
                    year: entry.year,
                    relevance: entry.relevance,
                })
            })
            .collect();
        KnowledgeBase::from_entries(papers, self.rules)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeFormat {
    Yaml,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnowledgeSource {
    Builtin,
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StrategyResult {
    pub outcome: Outcome,
    /// Retrieval context; absent when the guardrail refused the task before retrieval.
    pub context: Option<String>,
    pub response: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailReport {
    pub allowed: bool,
    pub matched_phrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeSummary {
    pub source: KnowledgeSource,
    pub fingerprint: String,
    pub paper_count: usize,
    pub rule_count: usize,
    pub triggers: Vec<String>,
    pub deny_phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Scenario {
    pub name: &'static str,
    pub title: &'static str,
    pub query: Query,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub title: &'static str,
    pub query: Query,
    pub result: StrategyResult,
}

/// Demo queries covering each terminal shape of the engine.
#[must_use]
pub fn builtin_scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "low-bandwidth-laser",
            title: "Hardware limitation: low-bandwidth light source",
            query: Query::new("Retinal layer reconstruction")
                .with_metadata("hardware", "Low-bandwidth laser (30nm)")
                .with_metadata("resolution", "Low")
                .with_metadata("issue", "Blurry layers"),
        },
        Scenario {
            name: "rare-pathology",
            title: "Rare pathology with extreme class imbalance",
            query: Query::new("Microaneurysm segmentation")
                .with_metadata("modality", "Fundus")
                .with_metadata("issue", "Extreme class imbalance (1:1000)"),
        },
        Scenario {
            name: "blurry-scans",
            title: "Resolution enhancement on a narrow-band source",
            query: Query::new("Enhance resolution of these blurry OCT scans.")
                .with_metadata("hardware", "Light source bandwidth ~30nm")
                .with_metadata("modality", "SD-OCT"),
        },
        Scenario {
            name: "diagnosis-request",
            title: "Clinical diagnosis request (guardrail)",
            query: Query::new("diagnose me please").with_metadata("modality", "SD-OCT"),
        },
    ]
}

/// Read a YAML or JSON knowledge file and validate it.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or when its contents
/// violate a knowledge base invariant.
pub fn load_knowledge_file(path: &Path) -> Result<KnowledgeBase> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read knowledge file {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both formats.
    let file: KnowledgeFile = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse knowledge file {}", path.display()))?;
    let base = file
        .into_knowledge_base()
        .with_context(|| format!("invalid knowledge file {}", path.display()))?;
    info!(
        path = %path.display(),
        papers = base.papers().len(),
        rules = base.rules().len(),
        "loaded knowledge file"
    );
    Ok(base)
}

/// Serialize a knowledge base in the on-disk knowledge file format.
///
/// # Errors
/// Returns an error when serialization fails.
pub fn render_knowledge_file(base: &KnowledgeBase, format: KnowledgeFormat) -> Result<String> {
    let file = KnowledgeFile::from_knowledge_base(base);
    match format {
        KnowledgeFormat::Yaml => {
            serde_yaml::to_string(&file).context("failed to render knowledge file as YAML")
        }
        KnowledgeFormat::Json => {
            serde_json::to_string_pretty(&file).context("failed to render knowledge file as JSON")
        }
    }
}

/// Content hash of a knowledge base, formatted as `sha256:<hex>`.
///
/// Papers hash in key order and rules in declared order, so two bases that retrieve
/// identically share a fingerprint regardless of file format.
///
/// # Errors
/// Returns an error when the canonical serialization fails.
pub fn knowledge_fingerprint(base: &KnowledgeBase) -> Result<String> {
    let canonical = serde_json::to_vec(&KnowledgeFile::from_knowledge_base(base))
        .context("failed to serialize knowledge base for fingerprinting")?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("sha256:{digest:x}"))
}

/// Knowledge file path configured through [`KNOWLEDGE_BASE_ENV`], if any.
#[must_use]
pub fn knowledge_base_path_from_env() -> Option<PathBuf> {
    std::env::var(KNOWLEDGE_BASE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone)]
pub struct AdvisorApi {
    engine: SynthesisEngine,
    source: KnowledgeSource,
    fingerprint: String,
}

impl AdvisorApi {
    /// Wrap an already constructed engine.
    ///
    /// # Errors
    /// Returns an error when the knowledge base cannot be fingerprinted.
    pub fn with_engine(engine: SynthesisEngine, source: KnowledgeSource) -> Result<Self> {
        let fingerprint = knowledge_fingerprint(engine.knowledge_base())?;
        Ok(Self { engine, source, fingerprint })
    }

    /// Advisor over the builtin OCT knowledge base with the default guardrail.
    ///
    /// # Errors
    /// Returns an error when the builtin knowledge base fails validation.
    pub fn builtin() -> Result<Self> {
        let base = builtin_knowledge_base().context("builtin knowledge base is invalid")?;
        Self::with_engine(
            SynthesisEngine::new(Arc::new(base), Guardrail::default()),
            KnowledgeSource::Builtin,
        )
    }

    /// Advisor over a knowledge file with the default guardrail.
    ///
    /// # Errors
    /// Returns an error when the file cannot be loaded or validated.
    pub fn from_knowledge_file(path: &Path) -> Result<Self> {
        let base = load_knowledge_file(path)?;
        Self::with_engine(
            SynthesisEngine::new(Arc::new(base), Guardrail::default()),
            KnowledgeSource::File { path: path.to_path_buf() },
        )
    }

    /// Resolve the knowledge source: explicit path, then [`KNOWLEDGE_BASE_ENV`], then builtin.
    ///
    /// # Errors
    /// Returns an error when the selected knowledge source fails to load.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(knowledge_base_path_from_env) {
            Some(path) => Self::from_knowledge_file(&path),
            None => Self::builtin(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &SynthesisEngine {
        &self.engine
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn strategy(&self, query: &Query) -> StrategyResult {
        let response = self.engine.generate(query);
        let outcome = response.outcome();
        let context = (outcome != Outcome::Refused).then(|| query.context_string());
        StrategyResult { outcome, context, response }
    }

    #[must_use]
    pub fn guardrail_check(&self, task: &str) -> GuardrailReport {
        let matched_phrase = self.engine.guardrail().matched_phrase(task).map(str::to_string);
        GuardrailReport { allowed: matched_phrase.is_none(), matched_phrase }
    }

    #[must_use]
    pub fn knowledge_summary(&self) -> KnowledgeSummary {
        let base = self.engine.knowledge_base();
        KnowledgeSummary {
            source: self.source.clone(),
            fingerprint: self.fingerprint.clone(),
            paper_count: base.papers().len(),
            rule_count: base.rules().len(),
            triggers: base.rules().iter().map(|rule| rule.trigger.clone()).collect(),
            deny_phrases: self.engine.guardrail().phrases().to_vec(),
        }
    }

    #[must_use]
    pub fn knowledge_file(&self) -> KnowledgeFile {
        KnowledgeFile::from_knowledge_base(self.engine.knowledge_base())
    }

    /// Render the active knowledge base as a knowledge file.
    ///
    /// # Errors
    /// Returns an error when serialization fails.
    pub fn export_knowledge(&self, format: KnowledgeFormat) -> Result<String> {
        render_knowledge_file(self.engine.knowledge_base(), format)
    }

    /// Run one builtin scenario by name.
    ///
    /// # Errors
    /// Returns an error when no scenario has that name.
    pub fn run_scenario(&self, name: &str) -> Result<ScenarioResult> {
        let scenario = builtin_scenarios()
            .into_iter()
            .find(|scenario| scenario.name == name)
            .ok_or_else(|| anyhow!("unknown scenario: {name}"))?;
        Ok(self.run(scenario))
    }

    #[must_use]
    pub fn run_all_scenarios(&self) -> Vec<ScenarioResult> {
        builtin_scenarios().into_iter().map(|scenario| self.run(scenario)).collect()
    }

    fn run(&self, scenario: Scenario) -> ScenarioResult {
        let result = self.strategy(&scenario.query);
        ScenarioResult { name: scenario.name, title: scenario.title, query: scenario.query, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE_YAML: &str = r"
papers:
  - key: speckle_paper
    title: Speckle Reduction in OCT
    author: Doe et al.
    year: 2015
    relevance: Denoising
rules:
  - trigger: speckle
    warning: Speckle masks thin layers.
    recommendation: Average registered B-scans.
    citation: speckle_paper
  - trigger: motion
    warning: Saccades break volume continuity.
    recommendation: Register volumes before segmentation.
";

    fn unique_temp_file(extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("oct-advisor-api-{}.{extension}", ulid::Ulid::new()))
    }

    fn write_fixture(body: &str, extension: &str) -> Result<PathBuf> {
        let path = unique_temp_file(extension);
        fs::write(&path, body)
            .with_context(|| format!("failed to write fixture {}", path.display()))?;
        Ok(path)
    }

    // Test IDs: TAPI-001
    #[test]
    fn builtin_summary_reports_counts_and_fingerprint() -> Result<()> {
        let api = AdvisorApi::builtin()?;
        let summary = api.knowledge_summary();

        assert_eq!(summary.source, KnowledgeSource::Builtin);
        assert_eq!(summary.paper_count, 4);
        assert_eq!(summary.rule_count, 4);
        assert_eq!(summary.triggers, vec!["30nm", "imbalance", "quantification", "compression"]);
        assert!(summary.fingerprint.starts_with("sha256:"));
        assert_eq!(summary.fingerprint.len(), "sha256:".len() + 64);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn yaml_knowledge_file_drives_retrieval() -> Result<()> {
        let path = write_fixture(FIXTURE_YAML, "yaml")?;
        let api = AdvisorApi::from_knowledge_file(&path)?;

        let result = api.strategy(
            &Query::new("Choroid segmentation").with_metadata("issue", "heavy Speckle noise"),
        );

        assert_eq!(result.outcome, Outcome::Strategy);
        assert_eq!(result.context.as_deref(), Some("Choroid segmentation  heavy Speckle noise"));
        let Response::Strategy(report) = result.response else {
            panic!("expected strategy response");
        };
        assert_eq!(report.supporting_evidence, vec!["Speckle Reduction in OCT (Doe et al., 2015)"]);

        let _ = fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn json_export_reloads_with_identical_fingerprint() -> Result<()> {
        let api = AdvisorApi::builtin()?;
        let path = write_fixture(&api.export_knowledge(KnowledgeFormat::Json)?, "json")?;

        let reloaded = AdvisorApi::from_knowledge_file(&path)?;
        assert_eq!(reloaded.fingerprint(), api.fingerprint());
        assert_eq!(reloaded.knowledge_file(), api.knowledge_file());

        let _ = fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn invalid_knowledge_files_fail_to_load() -> Result<()> {
        let duplicate = write_fixture(
            r"
papers:
  - {key: a, title: A, author: X, year: 2000}
  - {key: a, title: B, author: Y, year: 2001}
",
            "yaml",
        )?;
        let unknown = write_fixture(
            r"
rules:
  - {trigger: speckle, warning: W, recommendation: R, citation: missing}
",
            "yaml",
        )?;

        for (path, expected) in [(&duplicate, "MUST be unique"), (&unknown, "cites unknown paper")] {
            let err = match AdvisorApi::from_knowledge_file(path) {
                Ok(_) => panic!("knowledge file {} should be rejected", path.display()),
                Err(err) => err,
            };
            assert!(format!("{err:#}").contains(expected), "unexpected error: {err:#}");
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn fingerprint_changes_with_rule_content() -> Result<()> {
        let api = AdvisorApi::builtin()?;
        let mut file = api.knowledge_file();
        file.rules[0].recommendation = "Use a paired super-resolution model.".to_string();

        let edited = file.into_knowledge_base()?;
        assert_ne!(knowledge_fingerprint(&edited)?, api.fingerprint());
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn builtin_scenarios_cover_each_outcome() -> Result<()> {
        let api = AdvisorApi::builtin()?;
        let outcomes = api
            .run_all_scenarios()
            .into_iter()
            .map(|scenario| (scenario.name, scenario.result.outcome))
            .collect::<Vec<_>>();

        assert_eq!(
            outcomes,
            vec![
                ("low-bandwidth-laser", Outcome::Strategy),
                ("rare-pathology", Outcome::Strategy),
                ("blurry-scans", Outcome::Strategy),
                ("diagnosis-request", Outcome::Refused),
            ]
        );
        assert!(api.run_scenario("no-such-scenario").is_err());
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn refusals_carry_no_context_and_guardrail_reports_phrase() -> Result<()> {
        let api = AdvisorApi::builtin()?;

        let result = api.strategy(&Query::new("What treatment for AMD?"));
        assert_eq!(result.outcome, Outcome::Refused);
        assert!(result.context.is_none());

        let report = api.guardrail_check("What treatment for AMD?");
        assert!(!report.allowed);
        assert_eq!(report.matched_phrase.as_deref(), Some("treatment for"));
        assert!(api.guardrail_check("Layer segmentation").allowed);
        Ok(())
    }
}
