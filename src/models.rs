use crate::registry::{self, NodeType};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One decoded JSON object, exactly as it appeared in the source file.
pub type RawRecord = serde_json::Map<String, Value>;

/// Node or relationship properties as sent to a store. Ordered so that
/// comparisons and rendered output are stable.
pub type PropertyMap = BTreeMap<String, Value>;

/// Which dump a file came from. Each kind has its own record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Papers,
    Links,
    Evaluations,
    Methods,
    Datasets,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Papers,
        SourceKind::Links,
        SourceKind::Evaluations,
        SourceKind::Methods,
        SourceKind::Datasets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Papers => "papers",
            SourceKind::Links => "links",
            SourceKind::Evaluations => "evaluations",
            SourceKind::Methods => "methods",
            SourceKind::Datasets => "datasets",
        }
    }

    /// Uncompressed file name in a dump directory.
    pub fn file_name(self) -> &'static str {
        match self {
            SourceKind::Papers => "papers-with-abstracts.json",
            SourceKind::Links => "links-between-papers-and-code.json",
            SourceKind::Evaluations => "evaluation-tables.json",
            SourceKind::Methods => "methods.json",
            SourceKind::Datasets => "datasets.json",
        }
    }

    /// Finds this kind's file in `dir`, preferring the plain file over `.gz`.
    pub fn locate(self, dir: &Path) -> Option<PathBuf> {
        let plain = dir.join(self.file_name());
        if plain.is_file() {
            return Some(plain);
        }
        let gz = dir.join(format!("{}.gz", self.file_name()));
        gz.is_file().then_some(gz)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    PyTorch,
    TensorFlow,
    Keras,
    Jax,
    Sklearn,
    HuggingFace,
    MxNet,
    Paddle,
    Caffe,
    Unknown,
}

impl Framework {
    pub fn as_str(self) -> &'static str {
        match self {
            Framework::PyTorch => "pytorch",
            Framework::TensorFlow => "tensorflow",
            Framework::Keras => "keras",
            Framework::Jax => "jax",
            Framework::Sklearn => "sklearn",
            Framework::HuggingFace => "huggingface",
            Framework::MxNet => "mxnet",
            Framework::Paddle => "paddle",
            Framework::Caffe => "caffe",
            Framework::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub published: Option<NaiveDate>,
    pub venue: Option<String>,
    pub citation_count: u64,
    pub arxiv_id: Option<String>,
    pub url_abs: Option<String>,
    pub paper_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repository {
    pub url: String,
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub stars: u64,
    pub framework: Framework,
    pub language: Option<String>,
    pub license: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub full_name: Option<String>,
    pub description: Option<String>,
    pub paper_count: u64,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub area: Option<String>,
}

impl Task {
    /// A task known only by the name a paper listed it under.
    pub fn stub(name: &str) -> Self {
        Task {
            id: name.to_string(),
            name: name.to_string(),
            description: None,
            area: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
    pub affiliation: Option<String>,
}

/// A validated entity that maps onto one managed node label.
///
/// `properties` includes the key property itself. Absent optional fields are
/// sent as null so that an upsert fully replaces what an earlier write stored.
pub trait GraphEntity {
    const NODE: NodeType;

    fn key(&self) -> &str;

    fn properties(&self) -> PropertyMap;
}

fn opt(value: &Option<String>) -> Value {
    value.as_ref().map_or(Value::Null, |s| Value::String(s.clone()))
}

impl GraphEntity for Paper {
    const NODE: NodeType = registry::PAPER;

    fn key(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("id".into(), Value::from(self.id.clone()));
        props.insert("title".into(), Value::from(self.title.clone()));
        props.insert("abstract".into(), opt(&self.abstract_text));
        props.insert(
            "published".into(),
            self.published
                .map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string())),
        );
        props.insert("venue".into(), opt(&self.venue));
        props.insert("citation_count".into(), Value::from(self.citation_count));
        props.insert("arxiv_id".into(), opt(&self.arxiv_id));
        props.insert("url_abs".into(), opt(&self.url_abs));
        props.insert("paper_url".into(), opt(&self.paper_url));
        props
    }
}

impl GraphEntity for Repository {
    const NODE: NodeType = registry::REPOSITORY;

    fn key(&self) -> &str {
        &self.url
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("url".into(), Value::from(self.url.clone()));
        props.insert("owner".into(), Value::from(self.owner.clone()));
        props.insert("name".into(), Value::from(self.name.clone()));
        props.insert("description".into(), opt(&self.description));
        props.insert("stars".into(), Value::from(self.stars));
        props.insert("framework".into(), Value::from(self.framework.as_str()));
        props.insert("language".into(), opt(&self.language));
        props.insert("license".into(), opt(&self.license));
        props
    }
}

impl GraphEntity for Dataset {
    const NODE: NodeType = registry::DATASET;

    fn key(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("id".into(), Value::from(self.id.clone()));
        props.insert("name".into(), Value::from(self.name.clone()));
        props.insert("full_name".into(), opt(&self.full_name));
        props.insert("description".into(), opt(&self.description));
        props.insert("paper_count".into(), Value::from(self.paper_count));
        props.insert("url".into(), opt(&self.url));
        props
    }
}

impl GraphEntity for Task {
    const NODE: NodeType = registry::TASK;

    fn key(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("id".into(), Value::from(self.id.clone()));
        props.insert("name".into(), Value::from(self.name.clone()));
        props.insert("description".into(), opt(&self.description));
        props.insert("area".into(), opt(&self.area));
        props
    }
}

impl GraphEntity for Author {
    const NODE: NodeType = registry::AUTHOR;

    fn key(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("name".into(), Value::from(self.name.clone()));
        props.insert("email".into(), opt(&self.email));
        props.insert("affiliation".into(), opt(&self.affiliation));
        props
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperRecord {
    pub paper: Paper,
    pub authors: Vec<Author>,
    /// Task names as listed on the paper, deduplicated in order.
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    /// Every key the paper side of the link can be matched by
    /// (arxiv id, paper id, normalized paper url).
    pub paper_keys: Vec<String>,
    pub repository: Repository,
    pub official: Option<bool>,
}

/// A paper that reported a result for a task on a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvaluationRef {
    pub paper_url: String,
    pub dataset: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub task: Task,
    pub references: Vec<EvaluationRef>,
}

/// A normalized record, tagged by the dump it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Paper(PaperRecord),
    Link(LinkRecord),
    Dataset(Dataset),
    Evaluation(EvaluationRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn locate_prefers_plain_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("datasets.json"), "[]").unwrap();
        std::fs::write(dir.path().join("datasets.json.gz"), "").unwrap();
        let found = SourceKind::Datasets.locate(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "datasets.json");
    }

    #[test]
    fn locate_falls_back_to_gzip() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("evaluation-tables.json.gz"), "").unwrap();
        let found = SourceKind::Evaluations.locate(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "evaluation-tables.json.gz");
        assert!(SourceKind::Papers.locate(dir.path()).is_none());
    }

    #[test]
    fn paper_properties_carry_nulls() {
        let paper = Paper {
            id: "1706.03762".into(),
            title: "Attention Is All You Need".into(),
            abstract_text: None,
            published: NaiveDate::from_ymd_opt(2017, 6, 12),
            venue: Some("NeurIPS".into()),
            citation_count: 42,
            arxiv_id: Some("1706.03762".into()),
            url_abs: None,
            paper_url: None,
        };
        let props = paper.properties();
        assert_eq!(props["id"], Value::from("1706.03762"));
        assert_eq!(props["published"], Value::from("2017-06-12"));
        assert_eq!(props["abstract"], Value::Null);
        assert_eq!(props["citation_count"], Value::from(42u64));
        assert_eq!(paper.key(), "1706.03762");
    }

    #[test]
    fn repository_framework_serializes_lowercase() {
        let repo = Repository {
            url: "https://github.com/a/b".into(),
            owner: "a".into(),
            name: "b".into(),
            description: None,
            stars: 0,
            framework: Framework::HuggingFace,
            language: None,
            license: None,
        };
        assert_eq!(repo.properties()["framework"], Value::from("huggingface"));
        assert_eq!(<Repository as GraphEntity>::NODE.key, "url");
    }

    #[test]
    fn task_stub_uses_name_as_id() {
        let task = Task::stub("Image Classification");
        assert_eq!(task.id, "Image Classification");
        assert_eq!(task.key(), "Image Classification");
        assert!(task.area.is_none());
    }
}
