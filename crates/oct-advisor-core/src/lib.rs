use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

/// Fixed reason returned for every task the guardrail blocks.
pub const REFUSAL_REASON: &str = "REFUSAL: Agent cannot perform clinical diagnosis.";

/// Fixed strategy returned when no rule matches the query context.
pub const BASELINE_STRATEGY: &str = "Standard UNet Baseline";

/// Status value carried by every serialized strategy response.
pub const STRATEGY_STATUS: &str = "success";

/// Metadata fields appended to the task text, in order, to form the retrieval context.
pub const CONTEXT_METADATA_KEYS: [&str; 2] = ["hardware", "issue"];

/// Clinical-diagnosis phrasings rejected by the default guardrail.
pub const DEFAULT_DENY_PHRASES: [&str; 3] = ["diagnose", "do i have", "treatment for"];

const MIN_PAPER_YEAR_EXCLUSIVE: u16 = 1900;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigurationError {
    #[error("rule trigger MUST contain a non-whitespace character (rule index {index})")]
    EmptyTrigger { index: usize },
    #[error("rule trigger MUST be lowercase: `{trigger}`")]
    NonLowercaseTrigger { trigger: String },
    #[error("rule trigger MUST be unique: `{trigger}` is declared more than once")]
    DuplicateTrigger { trigger: String },
    #[error("rule `{trigger}` MUST provide a non-empty {field}")]
    EmptyRuleText { trigger: String, field: &'static str },
    #[error("rule `{trigger}` cites unknown paper `{citation}`")]
    UnknownCitation { trigger: String, citation: String },
    #[error("paper key MUST be non-empty")]
    EmptyPaperKey,
    #[error("paper key MUST be unique: `{key}` is declared more than once")]
    DuplicatePaper { key: String },
    #[error("paper `{key}` MUST provide a non-empty {field}")]
    EmptyPaperText { key: String, field: &'static str },
    #[error("paper `{key}` year MUST be > 1900 (received: {year})")]
    InvalidPaperYear { key: String, year: u16 },
    #[error("guardrail deny-list phrase MUST be non-empty")]
    EmptyDenyPhrase,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Paper {
    pub title: String,
    pub author: String,
    pub year: u16,
    pub relevance: String,
}

impl Paper {
    #[must_use]
    pub fn new(title: &str, author: &str, year: u16, relevance: &str) -> Self {
        Self {
            title: title.to_string(),
            author: author.to_string(),
            year,
            relevance: relevance.to_string(),
        }
    }

    /// Citation string used in `supporting_evidence`: `Title (Author, Year)`.
    #[must_use]
    pub fn citation(&self) -> String {
        self.to_string()
    }

    fn validate(&self, key: &str) -> Result<(), ConfigurationError> {
        if key.trim().is_empty() {
            return Err(ConfigurationError::EmptyPaperKey);
        }

        for (field, value) in [("title", &self.title), ("author", &self.author)] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::EmptyPaperText { key: key.to_string(), field });
            }
        }

        if self.year <= MIN_PAPER_YEAR_EXCLUSIVE {
            return Err(ConfigurationError::InvalidPaperYear {
                key: key.to_string(),
                year: self.year,
            });
        }

        Ok(())
    }
}

impl Display for Paper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.title, self.author, self.year)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rule {
    pub trigger: String,
    pub warning: String,
    pub recommendation: String,
    #[serde(default)]
    pub citation: Option<String>,
}

impl Rule {
    #[must_use]
    pub fn new(trigger: &str, warning: &str, recommendation: &str, citation: Option<&str>) -> Self {
        Self {
            trigger: trigger.to_string(),
            warning: warning.to_string(),
            recommendation: recommendation.to_string(),
            citation: citation.map(str::to_string),
        }
    }

    /// `lowered_context` must already be lowercase; triggers are stored lowercase.
    #[must_use]
    pub fn matches(&self, lowered_context: &str) -> bool {
        lowered_context.contains(self.trigger.as_str())
    }

    #[must_use]
    pub fn trace_entry(&self) -> String {
        format!("Due to '{}', we must address: {}", self.trigger, self.warning)
    }

    fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        // The context always carries separator spaces, so a blank trigger would match everything.
        if self.trigger.trim().is_empty() {
            return Err(ConfigurationError::EmptyTrigger { index });
        }

        if self.trigger != self.trigger.to_lowercase() {
            return Err(ConfigurationError::NonLowercaseTrigger { trigger: self.trigger.clone() });
        }

        for (field, value) in
            [("warning", &self.warning), ("recommendation", &self.recommendation)]
        {
            if value.trim().is_empty() {
                return Err(ConfigurationError::EmptyRuleText {
                    trigger: self.trigger.clone(),
                    field,
                });
            }
        }

        Ok(())
    }
}

/// Immutable reference data: citation key → paper, plus the ordered rule list.
///
/// Every invariant is checked once in [`KnowledgeBase::new`]; afterwards the base is
/// read-only and can be shared across threads behind an [`Arc`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KnowledgeBase {
    papers: BTreeMap<String, Paper>,
    rules: Vec<Rule>,
}

impl KnowledgeBase {
    /// Build a validated knowledge base.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] when a paper or rule is malformed, when two rules
    /// declare the same trigger, or when a rule cites a paper key that does not exist.
    pub fn new(
        papers: BTreeMap<String, Paper>,
        rules: Vec<Rule>,
    ) -> Result<Self, ConfigurationError> {
        for (key, paper) in &papers {
            paper.validate(key)?;
        }

        let mut seen_triggers = std::collections::BTreeSet::new();
        for (index, rule) in rules.iter().enumerate() {
            rule.validate(index)?;

            if !seen_triggers.insert(rule.trigger.as_str()) {
                return Err(ConfigurationError::DuplicateTrigger { trigger: rule.trigger.clone() });
            }

            if let Some(citation) = &rule.citation {
                if !papers.contains_key(citation) {
                    return Err(ConfigurationError::UnknownCitation {
                        trigger: rule.trigger.clone(),
                        citation: citation.clone(),
                    });
                }
            }
        }

        Ok(Self { papers, rules })
    }

    /// Build a knowledge base from keyed paper entries, rejecting repeated keys
    /// instead of letting a later entry shadow an earlier one.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::DuplicatePaper`] for a repeated key, or any error
    /// produced by [`KnowledgeBase::new`].
    pub fn from_entries(
        papers: Vec<(String, Paper)>,
        rules: Vec<Rule>,
    ) -> Result<Self, ConfigurationError> {
        let mut keyed = BTreeMap::new();
        for (key, paper) in papers {
            if keyed.contains_key(&key) {
                return Err(ConfigurationError::DuplicatePaper { key });
            }
            keyed.insert(key, paper);
        }
        Self::new(keyed, rules)
    }

    /// Return every rule whose trigger occurs in `context`, compared case-insensitively,
    /// in the order the rules were declared.
    #[must_use]
    pub fn retrieve_context(&self, context: &str) -> Vec<&Rule> {
        let lowered = context.to_lowercase();
        self.rules.iter().filter(|rule| rule.matches(&lowered)).collect()
    }

    #[must_use]
    pub fn lookup_paper(&self, key: &str) -> Option<&Paper> {
        self.papers.get(key)
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn papers(&self) -> &BTreeMap<String, Paper> {
        &self.papers
    }
}

/// Lexical deny-list filter for clinical-diagnosis requests.
///
/// This is a substring check, not a classifier: rephrasings that avoid every listed
/// phrase ("what disease is shown here?") are allowed through.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Guardrail {
    phrases: Vec<String>,
}

impl Default for Guardrail {
    fn default() -> Self {
        Self { phrases: DEFAULT_DENY_PHRASES.iter().map(|phrase| (*phrase).to_string()).collect() }
    }
}

impl Guardrail {
    /// Build a guardrail over a custom deny list. Phrases are lowercased.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::EmptyDenyPhrase`] when a phrase is blank.
    pub fn with_phrases<I, S>(phrases: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for phrase in phrases {
            let phrase = phrase.as_ref();
            if phrase.trim().is_empty() {
                return Err(ConfigurationError::EmptyDenyPhrase);
            }
            normalized.push(phrase.to_lowercase());
        }
        Ok(Self { phrases: normalized })
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// First deny-list phrase found in `task`, if any.
    #[must_use]
    pub fn matched_phrase(&self, task: &str) -> Option<&str> {
        let lowered = task.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// Returns `true` when the task is allowed.
    #[must_use]
    pub fn check(&self, task: &str) -> bool {
        match self.matched_phrase(task) {
            Some(phrase) => {
                warn!(phrase, "guardrail blocked task containing deny-list phrase");
                false
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Query {
    pub task: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Query {
    #[must_use]
    pub fn new(task: &str) -> Self {
        Self { task: task.to_string(), metadata: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn context_string(&self) -> String {
        context_string(&self.task, &self.metadata)
    }
}

/// Join the task with the selected metadata values, separated by single spaces.
///
/// Missing metadata keys contribute an empty string, so the separator count is fixed.
#[must_use]
pub fn context_string(task: &str, metadata: &BTreeMap<String, String>) -> String {
    let mut context = task.to_string();
    for key in CONTEXT_METADATA_KEYS {
        context.push(' ');
        context.push_str(metadata.get(key).map_or("", String::as_str));
    }
    context
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Refused,
    Baseline,
    Strategy,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refused => "refused",
            Self::Baseline => "baseline",
            Self::Strategy => "strategy",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct StrategyReport {
    pub reasoning_trace: Vec<String>,
    pub recommended_stack: BTreeMap<String, String>,
    pub supporting_evidence: Vec<String>,
}

impl Serialize for StrategyReport {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("status", STRATEGY_STATUS)?;
        map.serialize_entry("reasoning_trace", &self.reasoning_trace)?;
        map.serialize_entry("recommended_stack", &self.recommended_stack)?;
        map.serialize_entry("supporting_evidence", &self.supporting_evidence)?;
        map.end()
    }
}

/// Terminal result of one synthesis call.
///
/// Serializes to exactly one of:
/// - `{"error": reason}`
/// - `{"strategy": strategy}`
/// - `{"status": "success", "reasoning_trace": [..], "recommended_stack": {..}, "supporting_evidence": [..]}`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Response {
    Refusal { reason: String },
    Baseline { strategy: String },
    Strategy(StrategyReport),
}

impl Response {
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Refusal { .. } => Outcome::Refused,
            Self::Baseline { .. } => Outcome::Baseline,
            Self::Strategy(_) => Outcome::Strategy,
        }
    }

    #[must_use]
    pub fn reasoning_trace(&self) -> &[String] {
        match self {
            Self::Strategy(report) => &report.reasoning_trace,
            Self::Refusal { .. } | Self::Baseline { .. } => &[],
        }
    }
}

impl Serialize for Response {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Refusal { reason } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", reason)?;
                map.end()
            }
            Self::Baseline { strategy } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("strategy", strategy)?;
                map.end()
            }
            Self::Strategy(report) => report.serialize(serializer),
        }
    }
}

/// Guardrail → context → retrieval → aggregation over an injected knowledge base.
#[derive(Debug, Clone)]
pub struct SynthesisEngine {
    knowledge_base: Arc<KnowledgeBase>,
    guardrail: Guardrail,
}

impl SynthesisEngine {
    #[must_use]
    pub fn new(knowledge_base: Arc<KnowledgeBase>, guardrail: Guardrail) -> Self {
        Self { knowledge_base, guardrail }
    }

    #[must_use]
    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.knowledge_base
    }

    #[must_use]
    pub fn guardrail(&self) -> &Guardrail {
        &self.guardrail
    }

    #[must_use]
    pub fn generate(&self, query: &Query) -> Response {
        self.generate_strategy(&query.task, &query.metadata)
    }

    #[must_use]
    pub fn generate_strategy(&self, task: &str, metadata: &BTreeMap<String, String>) -> Response {
        if !self.guardrail.check(task) {
            return Response::Refusal { reason: REFUSAL_REASON.to_string() };
        }

        let context = context_string(task, metadata);
        let matched = self.knowledge_base.retrieve_context(&context);
        debug!(matched = matched.len(), context = %context, "retrieved rules");

        if matched.is_empty() {
            return Response::Baseline { strategy: BASELINE_STRATEGY.to_string() };
        }

        let mut report = StrategyReport::default();
        for rule in matched {
            report.reasoning_trace.push(rule.trace_entry());
            report.recommended_stack.insert(rule.trigger.clone(), rule.recommendation.clone());

            // Citation keys are resolved at construction; a miss here cannot happen.
            if let Some(paper) =
                rule.citation.as_deref().and_then(|key| self.knowledge_base.lookup_paper(key))
            {
                report.supporting_evidence.push(paper.citation());
            }
        }

        Response::Strategy(report)
    }
}

#[must_use]
pub fn builtin_papers() -> Vec<(String, Paper)> {
    vec![
        (
            "unet_plus".to_string(),
            Paper::new("UNet++: A Nested U-Net Architecture", "Zhou et al.", 2018, "Segmentation"),
        ),
        (
            "cyclegan".to_string(),
            Paper::new(
                "Unpaired Image-to-Image Translation",
                "Zhu et al.",
                2017,
                "Domain Adaptation",
            ),
        ),
        (
            "focal_loss".to_string(),
            Paper::new(
                "Focal Loss for Dense Object Detection",
                "Lin et al.",
                2017,
                "Class Imbalance",
            ),
        ),
        (
            "nnunet".to_string(),
            Paper::new("nnU-Net: Self-adapting Framework", "Isensee et al.", 2021, "AutoML"),
        ),
    ]
}

#[must_use]
pub fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "30nm",
            "Risk of structural layer thickening artifacts.",
            "Use CycleGAN with Structure-Consistency Loss.",
            Some("cyclegan"),
        ),
        Rule::new(
            "imbalance",
            "Target class < 5% of volume.",
            "Switch to Focal Loss + Oversampling.",
            Some("focal_loss"),
        ),
        Rule::new(
            "quantification",
            "Potential affine projection errors.",
            "Verify Pixel-to-Physical mapping matrix.",
            Some("nnunet"),
        ),
        Rule::new(
            "compression",
            "Standard JPEG block artifacts destroy 16-bit dynamic range.",
            "Use JPEG-2000 or nvJPEG (GPU).",
            None,
        ),
    ]
}

/// The OCT knowledge shipped with the advisor.
///
/// # Errors
/// Returns [`ConfigurationError`] only if the builtin tables are edited into an
/// inconsistent state.
pub fn builtin_knowledge_base() -> Result<KnowledgeBase, ConfigurationError> {
    KnowledgeBase::from_entries(builtin_papers(), builtin_rules())
}
