//! Raw JSON objects in, typed records out.
//!
//! Every function here is pure and total: a record either becomes exactly one
//! [`Record`] or a [`Rejection`] that the caller counts.

use crate::error::Rejection;
use crate::models::{
    Author, Dataset, EvaluationRecord, EvaluationRef, Framework, LinkRecord, Paper, PaperRecord,
    RawRecord, Record, Repository, SourceKind, Task,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde_json::Value;
use url::Url;

const UNTITLED: &str = "Untitled Paper";
const UNKNOWN: &str = "unknown";

static DATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})(?:-(\d{2}))?").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Pattern occurs anywhere in the lowercased field.
    Substring,
    /// Pattern equals the whole trimmed, lowercased field.
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameworkRule {
    pub pattern: &'static str,
    pub mode: MatchMode,
    pub framework: Framework,
}

const fn rule(pattern: &'static str, mode: MatchMode, framework: Framework) -> FrameworkRule {
    FrameworkRule {
        pattern,
        mode,
        framework,
    }
}

/// Evaluated top to bottom; the first matching rule wins.
pub static FRAMEWORK_RULES: &[FrameworkRule] = &[
    rule("pytorch", MatchMode::Substring, Framework::PyTorch),
    rule("torch", MatchMode::Substring, Framework::PyTorch),
    rule("tensorflow", MatchMode::Substring, Framework::TensorFlow),
    rule("tf", MatchMode::Exact, Framework::TensorFlow),
    rule("keras", MatchMode::Substring, Framework::Keras),
    rule("jax", MatchMode::Substring, Framework::Jax),
    rule("flax", MatchMode::Substring, Framework::Jax),
    rule("sklearn", MatchMode::Substring, Framework::Sklearn),
    rule("scikit", MatchMode::Substring, Framework::Sklearn),
    rule("huggingface", MatchMode::Substring, Framework::HuggingFace),
    rule("hugging face", MatchMode::Substring, Framework::HuggingFace),
    rule("transformers", MatchMode::Substring, Framework::HuggingFace),
    rule("mxnet", MatchMode::Substring, Framework::MxNet),
    rule("paddle", MatchMode::Substring, Framework::Paddle),
    rule("caffe", MatchMode::Substring, Framework::Caffe),
];

pub fn normalize(kind: SourceKind, raw: &RawRecord) -> Result<Record, Rejection> {
    match kind {
        SourceKind::Papers => normalize_paper(raw).map(Record::Paper),
        SourceKind::Links => normalize_link(raw).map(Record::Link),
        SourceKind::Datasets => normalize_dataset(raw).map(Record::Dataset),
        SourceKind::Evaluations => normalize_evaluation(raw).map(Record::Evaluation),
        SourceKind::Methods => Err(Rejection::UnsupportedSource("methods")),
    }
}

pub fn normalize_paper(raw: &RawRecord) -> Result<PaperRecord, Rejection> {
    let paper_url = string_field(raw, "paper_url").and_then(|u| normalize_url(&u).ok());
    let id = first_string(raw, &["arxiv_id", "id", "paper_id"])
        .or_else(|| paper_url.clone())
        .ok_or(Rejection::MissingIdentifier("arxiv_id, id, paper_id, paper_url"))?;

    let paper = Paper {
        id,
        title: string_field(raw, "title").unwrap_or_else(|| UNTITLED.to_string()),
        abstract_text: string_field(raw, "abstract"),
        published: parse_date(raw.get("date").or_else(|| raw.get("published"))),
        venue: first_string(raw, &["proceeding", "venue"]),
        citation_count: coerce_count(raw.get("citation_count")),
        arxiv_id: string_field(raw, "arxiv_id"),
        url_abs: first_string(raw, &["url_abs", "url"]),
        paper_url,
    };

    Ok(PaperRecord {
        paper,
        authors: parse_authors(raw.get("authors")),
        tasks: string_list(raw.get("tasks")),
    })
}

pub fn normalize_link(raw: &RawRecord) -> Result<LinkRecord, Rejection> {
    let raw_url = first_string(raw, &["repo_url", "url", "github_url"])
        .ok_or(Rejection::MissingIdentifier("repo_url, url, github_url"))?;
    let url = normalize_url(&raw_url)?;
    let (owner, name) = owner_and_name(&url);

    let description = string_field(raw, "description");
    let language = string_field(raw, "language");
    let explicit = first_string(raw, &["framework", "ml_framework"]);
    let framework = detect_framework(
        explicit.as_deref(),
        description.as_deref(),
        language.as_deref(),
    );

    let mut paper_keys = Vec::new();
    for key in ["paper_arxiv_id", "paper_id", "arxiv_id"] {
        if let Some(value) = string_field(raw, key) {
            push_unique(&mut paper_keys, value);
        }
    }
    if let Some(url) = string_field(raw, "paper_url").and_then(|u| normalize_url(&u).ok()) {
        push_unique(&mut paper_keys, url);
    }

    Ok(LinkRecord {
        paper_keys,
        repository: Repository {
            url,
            owner,
            name,
            description,
            stars: coerce_count(raw.get("stars")),
            framework,
            language,
            license: string_field(raw, "license"),
        },
        official: raw
            .get("is_official")
            .or_else(|| raw.get("official"))
            .and_then(Value::as_bool),
    })
}

pub fn normalize_dataset(raw: &RawRecord) -> Result<Dataset, Rejection> {
    let id = first_string(raw, &["id", "name"]).ok_or(Rejection::MissingIdentifier("id, name"))?;
    Ok(Dataset {
        name: string_field(raw, "name").unwrap_or_else(|| id.clone()),
        id,
        full_name: string_field(raw, "full_name"),
        description: string_field(raw, "description"),
        paper_count: coerce_count(raw.get("paper_count").or_else(|| raw.get("num_papers"))),
        url: string_field(raw, "url"),
    })
}

/// An evaluation table describes one task and the papers that reported
/// results on it, per dataset. Subtask tables are not descended into.
pub fn normalize_evaluation(raw: &RawRecord) -> Result<EvaluationRecord, Rejection> {
    let id = first_string(raw, &["id", "task", "name"])
        .ok_or(Rejection::MissingIdentifier("id, task, name"))?;
    let area = raw
        .get("categories")
        .and_then(Value::as_array)
        .and_then(|c| c.iter().find_map(|v| non_empty(v.as_str()?)));

    let task = Task {
        name: first_string(raw, &["task", "name"]).unwrap_or_else(|| id.clone()),
        id,
        description: string_field(raw, "description"),
        area,
    };

    let mut references = Vec::new();
    let mut seen = FxHashSet::default();
    for table in raw
        .get("datasets")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(dataset) = table
            .get("dataset")
            .and_then(Value::as_str)
            .and_then(non_empty)
        else {
            continue;
        };
        let rows = table
            .get("sota")
            .and_then(|s| s.get("rows"))
            .and_then(Value::as_array);
        for row in rows.into_iter().flatten() {
            let Some(paper_url) = row
                .get("paper_url")
                .and_then(Value::as_str)
                .and_then(|u| normalize_url(u).ok())
            else {
                continue;
            };
            let reference = EvaluationRef {
                paper_url,
                dataset: dataset.clone(),
            };
            if seen.insert(reference.clone()) {
                references.push(reference);
            }
        }
    }

    Ok(EvaluationRecord { task, references })
}

/// Coerces a count-like value to a nonnegative integer. Numeric strings parse,
/// negatives clamp to zero, fractions truncate, anything else is zero.
pub fn coerce_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u
            } else if n.as_i64().is_some() {
                0
            } else {
                n.as_f64().map_or(0, truncate_float)
            }
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                i.max(0) as u64
            } else {
                s.parse::<f64>().map_or(0, truncate_float)
            }
        }
        _ => 0,
    }
}

fn truncate_float(f: f64) -> u64 {
    if f.is_finite() && f > 0.0 {
        f.trunc() as u64
    } else {
        0
    }
}

/// Parses `YYYY-MM-DD` or `YYYY-MM` (as the first of the month) from the start
/// of a string. Anything else is `None`.
pub fn parse_date(value: Option<&Value>) -> Option<NaiveDate> {
    let s = value?.as_str()?.trim();
    let caps = DATE_PREFIX.captures(s)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = match caps.get(3) {
        Some(d) => d.as_str().parse().ok()?,
        None => 1,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Canonical form of a URL used as an identifier: scheme and host lowercased,
/// fragment dropped, trailing slash removed. A bare `host/path` gets `https://`.
pub fn normalize_url(input: &str) -> Result<String, Rejection> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Rejection::InvalidUrl(input.to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let mut url = Url::parse(&candidate).map_err(|_| Rejection::InvalidUrl(input.to_string()))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Rejection::InvalidUrl(input.to_string()));
    }
    url.set_fragment(None);

    let mut normalized = String::from(url);
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

/// Total and deterministic: the explicit field is tried first, then the
/// description, then the language; within a field the rule table is walked in
/// order.
pub fn detect_framework(
    explicit: Option<&str>,
    description: Option<&str>,
    language: Option<&str>,
) -> Framework {
    [explicit, description, language]
        .into_iter()
        .flatten()
        .find_map(match_framework)
        .unwrap_or(Framework::Unknown)
}

fn match_framework(field: &str) -> Option<Framework> {
    let lowered = field.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    FRAMEWORK_RULES
        .iter()
        .find(|r| match r.mode {
            MatchMode::Substring => lowered.contains(r.pattern),
            MatchMode::Exact => lowered == r.pattern,
        })
        .map(|r| r.framework)
}

/// Owner and name from the last two path segments of a repository URL.
fn owner_and_name(url: &str) -> (String, String) {
    let segments: Vec<String> = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        })
        .unwrap_or_default();
    match segments.as_slice() {
        [.., owner, name] => (owner.clone(), name.clone()),
        [name] => (UNKNOWN.to_string(), name.clone()),
        [] => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    }
}

fn parse_authors(value: Option<&Value>) -> Vec<Author> {
    let mut authors: Vec<Author> = Vec::new();
    let mut seen = FxHashSet::default();
    for entry in value.and_then(Value::as_array).into_iter().flatten() {
        let author = match entry {
            Value::String(s) => non_empty(s).map(|name| Author {
                name,
                email: None,
                affiliation: None,
            }),
            Value::Object(obj) => string_field(obj, "name").map(|name| Author {
                name,
                email: string_field(obj, "email"),
                affiliation: string_field(obj, "affiliation"),
            }),
            _ => None,
        };
        if let Some(author) = author {
            if seen.insert(author.name.clone()) {
                authors.push(author);
            }
        }
    }
    authors
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut out = Vec::new();
    for item in value.and_then(Value::as_array).into_iter().flatten() {
        let name = match item {
            Value::String(s) => non_empty(s),
            Value::Object(obj) => first_string(obj, &["task", "name"]),
            _ => None,
        };
        if let Some(name) = name {
            push_unique(&mut out, name);
        }
    }
    out
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// A trimmed, non-empty string field. Integer values are accepted and
/// rendered, since some dumps carry numeric identifiers.
fn string_field(raw: &RawRecord, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| string_field(raw, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn coerce_count_rules() {
        assert_eq!(coerce_count(Some(&json!(12))), 12);
        assert_eq!(coerce_count(Some(&json!("42"))), 42);
        assert_eq!(coerce_count(Some(&json!(" 7 "))), 7);
        assert_eq!(coerce_count(Some(&json!(-3))), 0);
        assert_eq!(coerce_count(Some(&json!("-3"))), 0);
        assert_eq!(coerce_count(Some(&json!(4.9))), 4);
        assert_eq!(coerce_count(Some(&json!("4.9"))), 4);
        assert_eq!(coerce_count(Some(&json!("many"))), 0);
        assert_eq!(coerce_count(Some(&json!(null))), 0);
        assert_eq!(coerce_count(Some(&json!([1]))), 0);
        assert_eq!(coerce_count(None), 0);
    }

    #[test]
    fn date_rules() {
        assert_eq!(parse_date(Some(&json!("2017-06-12"))), NaiveDate::from_ymd_opt(2017, 6, 12));
        assert_eq!(
            parse_date(Some(&json!("2017-06-12T10:00:00Z"))),
            NaiveDate::from_ymd_opt(2017, 6, 12)
        );
        assert_eq!(parse_date(Some(&json!("2019-03"))), NaiveDate::from_ymd_opt(2019, 3, 1));
        assert_eq!(parse_date(Some(&json!("2019-13-01"))), None);
        assert_eq!(parse_date(Some(&json!("June 2019"))), None);
        assert_eq!(parse_date(Some(&json!(2019))), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn url_rules() {
        assert_eq!(
            normalize_url("HTTPS://GitHub.com/Owner/Repo/").unwrap(),
            "https://github.com/Owner/Repo"
        );
        assert_eq!(
            normalize_url("github.com/a/b#readme").unwrap(),
            "https://github.com/a/b"
        );
        assert_eq!(normalize_url("https://example.org/").unwrap(), "https://example.org");
        assert!(matches!(normalize_url("   "), Err(Rejection::InvalidUrl(_))));
        assert!(matches!(normalize_url("http://"), Err(Rejection::InvalidUrl(_))));
    }

    #[test]
    fn framework_detection_order() {
        assert_eq!(detect_framework(Some("PyTorch"), None, None), Framework::PyTorch);
        assert_eq!(detect_framework(Some("tf"), None, None), Framework::TensorFlow);
        assert_eq!(detect_framework(Some("none"), Some("built on keras"), None), Framework::Keras);
        assert_eq!(
            detect_framework(None, Some("A JAX port of a torch model"), None),
            Framework::PyTorch
        );
        assert_eq!(detect_framework(None, None, Some("Python")), Framework::Unknown);
        assert_eq!(detect_framework(None, None, None), Framework::Unknown);
    }

    #[test]
    fn short_patterns_only_match_exactly() {
        assert_eq!(detect_framework(Some("stuff"), None, None), Framework::Unknown);
        assert_eq!(detect_framework(Some(" TF "), None, None), Framework::TensorFlow);
    }

    #[test]
    fn framework_detection_is_deterministic() {
        let a = detect_framework(Some("mxnet + paddle"), Some("caffe"), None);
        let b = detect_framework(Some("mxnet + paddle"), Some("caffe"), None);
        assert_eq!(a, b);
        assert_eq!(a, Framework::MxNet);
    }

    #[test]
    fn paper_identifier_precedence() {
        let record = normalize_paper(&raw(json!({
            "id": "attention",
            "arxiv_id": "1706.03762",
            "title": "Attention Is All You Need"
        })))
        .unwrap();
        assert_eq!(record.paper.id, "1706.03762");

        let record = normalize_paper(&raw(json!({
            "paper_url": "https://PapersWithCode.com/paper/foo/"
        })))
        .unwrap();
        assert_eq!(record.paper.id, "https://paperswithcode.com/paper/foo");
        assert_eq!(record.paper.title, "Untitled Paper");
    }

    #[test]
    fn paper_without_identifier_is_rejected() {
        let result = normalize_paper(&raw(json!({"title": "Orphan", "arxiv_id": "  "})));
        assert!(matches!(result, Err(Rejection::MissingIdentifier(_))));
    }

    #[test]
    fn paper_fields() {
        let record = normalize_paper(&raw(json!({
            "arxiv_id": "2001.00001",
            "title": "  Trimmed  ",
            "abstract": "text",
            "date": "2020-01-02",
            "proceeding": "ICML 2020",
            "citation_count": "15",
            "authors": ["Ada", {"name": "Grace", "email": "g@x.org"}, "Ada", "", 3],
            "tasks": ["Image Classification", "Image Classification", {"task": "Segmentation"}]
        })))
        .unwrap();
        assert_eq!(record.paper.title, "Trimmed");
        assert_eq!(record.paper.venue.as_deref(), Some("ICML 2020"));
        assert_eq!(record.paper.citation_count, 15);
        assert_eq!(record.paper.published, NaiveDate::from_ymd_opt(2020, 1, 2));
        let names: Vec<_> = record.authors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Grace"]);
        assert_eq!(record.authors[1].email.as_deref(), Some("g@x.org"));
        assert_eq!(record.tasks, vec!["Image Classification", "Segmentation"]);
    }

    #[test]
    fn link_record() {
        let record = normalize_link(&raw(json!({
            "paper_url": "https://paperswithcode.com/paper/attention",
            "paper_arxiv_id": "1706.03762",
            "repo_url": "https://GitHub.com/tensorflow/tensor2tensor/",
            "is_official": true,
            "framework": "tf",
            "stars": "-5"
        })))
        .unwrap();
        assert_eq!(record.repository.url, "https://github.com/tensorflow/tensor2tensor");
        assert_eq!(record.repository.owner, "tensorflow");
        assert_eq!(record.repository.name, "tensor2tensor");
        assert_eq!(record.repository.framework, Framework::TensorFlow);
        assert_eq!(record.repository.stars, 0);
        assert_eq!(record.official, Some(true));
        assert_eq!(
            record.paper_keys,
            vec!["1706.03762", "https://paperswithcode.com/paper/attention"]
        );
    }

    #[test]
    fn link_without_repository_is_rejected() {
        let result = normalize_link(&raw(json!({"paper_arxiv_id": "1"})));
        assert!(matches!(result, Err(Rejection::MissingIdentifier(_))));
        let result = normalize_link(&raw(json!({"repo_url": "://"})));
        assert!(matches!(result, Err(Rejection::InvalidUrl(_))));
    }

    #[test]
    fn repository_owner_fallback() {
        assert_eq!(
            owner_and_name("https://gitlab.com/solo"),
            ("unknown".to_string(), "solo".to_string())
        );
        assert_eq!(
            owner_and_name("https://example.org"),
            ("unknown".to_string(), "unknown".to_string())
        );
    }

    #[test]
    fn dataset_defaults() {
        let dataset = normalize_dataset(&raw(json!({"name": "ImageNet", "num_papers": 1200})))
            .unwrap();
        assert_eq!(dataset.id, "ImageNet");
        assert_eq!(dataset.name, "ImageNet");
        assert_eq!(dataset.paper_count, 1200);

        let dataset = normalize_dataset(&raw(json!({"id": 7}))).unwrap();
        assert_eq!(dataset.id, "7");
        assert_eq!(dataset.name, "7");

        assert!(normalize_dataset(&raw(json!({"full_name": "x"}))).is_err());
    }

    #[test]
    fn evaluation_table() {
        let record = normalize_evaluation(&raw(json!({
            "task": "Image Classification",
            "categories": ["Computer Vision"],
            "description": "Assign a label",
            "datasets": [
                {
                    "dataset": "ImageNet",
                    "sota": {"rows": [
                        {"paper_url": "https://paperswithcode.com/paper/resnet/"},
                        {"paper_url": "https://paperswithcode.com/paper/resnet"},
                        {"paper_title": "no url"}
                    ]}
                },
                {"dataset": "", "sota": {"rows": [{"paper_url": "https://x.org/p"}]}}
            ],
            "subtasks": [{"task": "Fine-Grained", "datasets": []}]
        })))
        .unwrap();
        assert_eq!(record.task.id, "Image Classification");
        assert_eq!(record.task.area.as_deref(), Some("Computer Vision"));
        assert_eq!(record.references.len(), 1);
        assert_eq!(record.references[0].dataset, "ImageNet");
        assert_eq!(
            record.references[0].paper_url,
            "https://paperswithcode.com/paper/resnet"
        );
    }

    #[test]
    fn methods_are_not_ingested() {
        let result = normalize(SourceKind::Methods, &raw(json!({"name": "Dropout"})));
        assert_eq!(result, Err(Rejection::UnsupportedSource("methods")));
    }
}
