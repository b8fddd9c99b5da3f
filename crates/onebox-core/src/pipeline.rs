//! Fan-out of freshly stored messages to downstream collaborators
//!
//! Every branch is independent: a failing classifier does not stop the
//! message from being indexed or embedded, and nothing here can affect the
//! row that was already written or the sync watermark.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{Database, EmailLabel, IngestSink, LabelEntry, LabelSet, StoredMessage};

/// Characters of body text embedded for the vector store
const CONTEXT_BODY_CHARS: usize = 2000;

/// Characters of body text used as a similarity query
const QUERY_BODY_CHARS: usize = 500;

const DEFAULT_IN_FLIGHT: u32 = 8;

/// Full-text search collaborator
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index or refresh every field except labels
    async fn index(&self, message: &StoredMessage) -> anyhow::Result<()>;

    /// Replace only the labels of an indexed message
    async fn update_labels(&self, message_id: i64, labels: &LabelSet) -> anyhow::Result<()>;
}

/// Label chosen by a classifier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: EmailLabel,
    pub confidence: f32,
    pub model: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, message: &StoredMessage) -> anyhow::Result<Classification>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Nearest-neighbour query with equality filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub limit: usize,
    /// Payload key/value pairs a hit must match
    pub must: Vec<(String, serde_json::Value)>,
    /// Point ids to leave out
    pub exclude_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: u64,
    pub score: f32,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, id: u64, vector: Vec<f32>, payload: serde_json::Value) -> anyhow::Result<()>;

    async fn search(&self, query: VectorQuery) -> anyhow::Result<Vec<VectorHit>>;
}

/// Outward channel for high-priority messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        message: &StoredMessage,
        classification: &Classification,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Index,
    Classify,
    Embed,
    Notify,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Branch::Index => "index",
            Branch::Classify => "classify",
            Branch::Embed => "embed",
            Branch::Notify => "notify",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BranchFailure {
    pub branch: Branch,
    pub error: String,
}

/// What happened to one message in the pipeline
#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub message_id: i64,
    pub completed: Vec<Branch>,
    pub failures: Vec<BranchFailure>,
    pub classification: Option<Classification>,
}

impl FanOutReport {
    fn record<T>(&mut self, branch: Branch, outcome: Option<anyhow::Result<T>>) -> Option<T> {
        match outcome? {
            Ok(value) => {
                self.completed.push(branch);
                Some(value)
            }
            Err(e) => {
                self.failures.push(BranchFailure {
                    branch,
                    error: format!("{:#}", e),
                });
                None
            }
        }
    }

    pub fn failed(&self, branch: Branch) -> bool {
        self.failures.iter().any(|f| f.branch == branch)
    }
}

/// Dispatches each ingested message to whichever collaborators are configured
#[derive(Clone)]
pub struct FanOutPipeline {
    database: Arc<Database>,
    index: Option<Arc<dyn SearchIndex>>,
    classifier: Option<Arc<dyn Classifier>>,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<dyn VectorStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    notify_on: EmailLabel,
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl FanOutPipeline {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            index: None,
            classifier: None,
            embedder: None,
            vectors: None,
            notifier: None,
            notify_on: EmailLabel::Interested,
            permits: Arc::new(Semaphore::new(DEFAULT_IN_FLIGHT as usize)),
            capacity: DEFAULT_IN_FLIGHT,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_embeddings(mut self, embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>) -> Self {
        self.embedder = Some(embedder);
        self.vectors = Some(vectors);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Label that triggers a notification (default: Interested)
    pub fn notify_on(mut self, label: EmailLabel) -> Self {
        self.notify_on = label;
        self
    }

    /// Messages processed concurrently before ingestion waits
    pub fn max_in_flight(mut self, permits: u32) -> Self {
        self.capacity = permits.max(1);
        self.permits = Arc::new(Semaphore::new(self.capacity as usize));
        self
    }

    /// Wait until every message handed to the sink has finished its branches
    pub async fn drain(&self) {
        match self.permits.acquire_many(self.capacity).await {
            Ok(all) => drop(all),
            Err(_) => debug!("Pipeline closed before draining"),
        }
    }

    /// Run every configured branch for one message
    pub async fn process(&self, message: &StoredMessage) -> FanOutReport {
        let (indexed, embedded, (classified, notified)) = tokio::join!(
            self.index_branch(message),
            self.embed_branch(message),
            self.classify_branch(message),
        );

        let mut report = FanOutReport {
            message_id: message.id,
            ..FanOutReport::default()
        };
        report.record(Branch::Index, indexed);
        report.record(Branch::Embed, embedded);
        report.classification = report.record(Branch::Classify, classified);
        report.record(Branch::Notify, notified);

        for failure in &report.failures {
            warn!(
                "Pipeline branch {} failed for message {}: {}",
                failure.branch, message.id, failure.error
            );
        }
        debug!(
            "Message {} fanned out: {} ok, {} failed",
            message.id,
            report.completed.len(),
            report.failures.len()
        );

        report
    }

    async fn index_branch(&self, message: &StoredMessage) -> Option<anyhow::Result<()>> {
        let index = self.index.as_ref()?;
        Some(index.index(message).await)
    }

    async fn embed_branch(&self, message: &StoredMessage) -> Option<anyhow::Result<()>> {
        let (embedder, vectors) = (self.embedder.as_ref()?, self.vectors.as_ref()?);
        let result = async {
            let id = u64::try_from(message.id).context("negative message id")?;
            let vector = embedder.embed(&context_text(message)).await?;
            vectors.upsert(id, vector, payload(message)).await
        }
        .await;
        Some(result)
    }

    async fn classify_branch(
        &self,
        message: &StoredMessage,
    ) -> (
        Option<anyhow::Result<Classification>>,
        Option<anyhow::Result<()>>,
    ) {
        let Some(classifier) = self.classifier.as_ref() else {
            return (None, None);
        };

        let classification = match self.classify_and_label(classifier.as_ref(), message).await {
            Ok(classification) => classification,
            Err(e) => return (Some(Err(e)), None),
        };

        let notified = match &self.notifier {
            Some(notifier) if classification.label == self.notify_on => {
                info!(
                    "Message {} classified {}, notifying",
                    message.id, classification.label
                );
                Some(notifier.notify(message, &classification).await)
            }
            _ => None,
        };

        (Some(Ok(classification)), notified)
    }

    async fn classify_and_label(
        &self,
        classifier: &dyn Classifier,
        message: &StoredMessage,
    ) -> anyhow::Result<Classification> {
        let classification = classifier.classify(message).await?;
        let entry = LabelEntry::new(
            classification.label,
            classification.confidence,
            classification.model.clone(),
        );
        let labels = self
            .database
            .add_label(message.id, entry)
            .await
            .context("storing label")?;

        if let Some(index) = &self.index {
            if let Err(e) = index.update_labels(message.id, &labels).await {
                warn!("Failed to push labels of message {} to the index: {:#}", message.id, e);
            }
        }

        Ok(classification)
    }

    /// Messages from the same account that read most like `message`
    pub async fn find_similar(
        &self,
        message: &StoredMessage,
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>> {
        let (Some(embedder), Some(vectors)) = (&self.embedder, &self.vectors) else {
            anyhow::bail!("similarity search needs an embedder and a vector store");
        };

        let text = format!(
            "{} {}",
            message.subject.as_deref().unwrap_or_default(),
            message.body_excerpt(QUERY_BODY_CHARS)
        );
        let vector = embedder.embed(&text).await?;

        vectors
            .search(VectorQuery {
                vector,
                limit,
                must: vec![("account_id".to_string(), json!(message.account_id))],
                exclude_ids: u64::try_from(message.id).into_iter().collect(),
            })
            .await
    }
}

#[async_trait]
impl IngestSink for FanOutPipeline {
    /// Runs the branches on a separate task; waits only when too many are in flight
    async fn on_message_ingested(&self, message: StoredMessage) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            warn!("Pipeline closed, dropping message {}", message.id);
            return;
        };

        let pipeline = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline.process(&message).await;
        });
    }
}

/// Text embedded for a message
fn context_text(message: &StoredMessage) -> String {
    format!(
        "Subject: {}\nFrom: {}\nDate: {}\nBody: {}",
        message.subject.as_deref().unwrap_or_default(),
        message.from,
        message.date.map(|d| d.to_string()).unwrap_or_default(),
        message.body_excerpt(CONTEXT_BODY_CHARS)
    )
}

/// Payload stored next to a message's vector
fn payload(message: &StoredMessage) -> serde_json::Value {
    json!({
        "email_id": message.id,
        "account_id": message.account_id,
        "folder": message.folder,
        "from": message.from,
        "subject": message.subject,
        "snippet": message.snippet,
        "date": message.date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{message, setup_account};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeIndex {
        indexed: Mutex<Vec<i64>>,
        labelled: Mutex<Vec<(i64, Vec<EmailLabel>)>>,
    }

    #[async_trait]
    impl SearchIndex for FakeIndex {
        async fn index(&self, message: &StoredMessage) -> anyhow::Result<()> {
            self.indexed.lock().unwrap().push(message.id);
            Ok(())
        }

        async fn update_labels(&self, message_id: i64, labels: &LabelSet) -> anyhow::Result<()> {
            self.labelled
                .lock()
                .unwrap()
                .push((message_id, labels.labels().collect()));
            Ok(())
        }
    }

    struct FixedClassifier(Option<EmailLabel>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _message: &StoredMessage) -> anyhow::Result<Classification> {
            match self.0 {
                Some(label) => Ok(Classification {
                    label,
                    confidence: 0.9,
                    model: "fixed".to_string(),
                }),
                None => anyhow::bail!("model unavailable"),
            }
        }
    }

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    #[derive(Default)]
    struct FakeVectors {
        points: Mutex<Vec<(u64, serde_json::Value)>>,
        queries: Mutex<Vec<VectorQuery>>,
    }

    #[async_trait]
    impl VectorStore for FakeVectors {
        async fn upsert(&self, id: u64, _vector: Vec<f32>, payload: serde_json::Value) -> anyhow::Result<()> {
            self.points.lock().unwrap().push((id, payload));
            Ok(())
        }

        async fn search(&self, query: VectorQuery) -> anyhow::Result<Vec<VectorHit>> {
            self.queries.lock().unwrap().push(query);
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, message: &StoredMessage, _c: &Classification) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.id);
            Ok(())
        }
    }

    struct Fakes {
        index: Arc<FakeIndex>,
        vectors: Arc<FakeVectors>,
        notifier: Arc<FakeNotifier>,
    }

    async fn pipeline(label: Option<EmailLabel>) -> (FanOutPipeline, Fakes, StoredMessage) {
        let (db, account_id) = setup_account().await;
        let stored = db.upsert_message(account_id, "INBOX", &message(11)).await.unwrap();

        let fakes = Fakes {
            index: Arc::new(FakeIndex::default()),
            vectors: Arc::new(FakeVectors::default()),
            notifier: Arc::new(FakeNotifier::default()),
        };
        let pipeline = FanOutPipeline::new(db)
            .with_index(fakes.index.clone())
            .with_classifier(Arc::new(FixedClassifier(label)))
            .with_embeddings(Arc::new(FakeEmbedder), fakes.vectors.clone())
            .with_notifier(fakes.notifier.clone());

        (pipeline, fakes, stored)
    }

    #[tokio::test]
    async fn test_interested_message_reaches_every_branch() {
        let (pipeline, fakes, stored) = pipeline(Some(EmailLabel::Interested)).await;

        let report = pipeline.process(&stored).await;

        assert!(report.failures.is_empty());
        assert_eq!(report.completed.len(), 4);
        assert_eq!(fakes.index.indexed.lock().unwrap().clone(), vec![stored.id]);
        assert_eq!(
            fakes.index.labelled.lock().unwrap().clone(),
            vec![(stored.id, vec![EmailLabel::Interested])]
        );
        assert_eq!(fakes.notifier.sent.lock().unwrap().clone(), vec![stored.id]);

        let points = fakes.vectors.points.lock().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].1["account_id"], json!(stored.account_id));

        let relabelled = pipeline.database.get_message(stored.id).await.unwrap();
        assert!(relabelled.labels.contains(EmailLabel::Interested));
    }

    #[tokio::test]
    async fn test_classifier_failure_is_isolated() {
        let (pipeline, fakes, stored) = pipeline(None).await;

        let report = pipeline.process(&stored).await;

        assert!(report.failed(Branch::Classify));
        assert_eq!(report.failures.len(), 1);
        assert!(report.completed.contains(&Branch::Index));
        assert!(report.completed.contains(&Branch::Embed));
        assert!(report.classification.is_none());
        assert!(fakes.notifier.sent.lock().unwrap().is_empty());

        let row = pipeline.database.get_message(stored.id).await.unwrap();
        assert!(row.labels.is_empty());
    }

    #[tokio::test]
    async fn test_other_labels_do_not_notify() {
        let (pipeline, fakes, stored) = pipeline(Some(EmailLabel::Spam)).await;

        let report = pipeline.process(&stored).await;

        assert_eq!(
            report.classification.map(|c| c.label),
            Some(EmailLabel::Spam)
        );
        assert!(!report.completed.contains(&Branch::Notify));
        assert!(fakes.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_branches_are_skipped() {
        let (db, account_id) = setup_account().await;
        let stored = db.upsert_message(account_id, "INBOX", &message(1)).await.unwrap();

        let report = FanOutPipeline::new(db).process(&stored).await;

        assert!(report.completed.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_sink_processes_in_background() {
        let (pipeline, fakes, stored) = pipeline(Some(EmailLabel::Interested)).await;

        pipeline.on_message_ingested(stored.clone()).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while fakes.notifier.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fakes.index.indexed.lock().unwrap().clone(), vec![stored.id]);
    }

    struct SlowIndex(FakeIndex);

    #[async_trait]
    impl SearchIndex for SlowIndex {
        async fn index(&self, message: &StoredMessage) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.index(message).await
        }

        async fn update_labels(&self, message_id: i64, labels: &LabelSet) -> anyhow::Result<()> {
            self.0.update_labels(message_id, labels).await
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_background_work() {
        let (db, account_id) = setup_account().await;
        let index = Arc::new(SlowIndex(FakeIndex::default()));
        let pipeline = FanOutPipeline::new(db.clone())
            .with_index(index.clone())
            .max_in_flight(2);

        let mut ids = Vec::new();
        for uid in 1..=3 {
            let stored = db.upsert_message(account_id, "INBOX", &message(uid)).await.unwrap();
            ids.push(stored.id);
            pipeline.on_message_ingested(stored).await;
        }
        tokio::time::timeout(Duration::from_secs(2), pipeline.drain())
            .await
            .unwrap();

        let mut indexed = index.0.indexed.lock().unwrap().clone();
        indexed.sort_unstable();
        assert_eq!(indexed, ids);
    }

    #[tokio::test]
    async fn test_similar_search_is_scoped_to_account() {
        let (pipeline, fakes, stored) = pipeline(Some(EmailLabel::Interested)).await;

        pipeline.find_similar(&stored, 5).await.unwrap();

        let queries = fakes.vectors.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].limit, 5);
        assert_eq!(
            queries[0].must,
            vec![("account_id".to_string(), json!(stored.account_id))]
        );
        assert_eq!(queries[0].exclude_ids, vec![stored.id as u64]);
    }
}
