// Test doubles shared by the unit tests

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::Result;
use crate::cancel::CancelToken;
use crate::embeddings::Embedder;
use crate::llm::LanguageModel;

/// Bag-of-words embedder: texts sharing words get similar vectors
pub struct FakeEmbedder {
    model: String,
    dimensions: usize,
    batch_calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(model: &str, dimensions: usize) -> Self {
        Self {
            model: model.to_string(),
            dimensions,
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|word| !word.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let bucket = usize::from(digest[0]) * 256 + usize::from(digest[1]);
            vector[bucket % self.dimensions] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>> {
        cancel.check()?;
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        cancel.check()?;
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|text| self.vector(text)).collect())
    }
}

type Responder = dyn Fn(&str) -> Result<String> + Send + Sync;

/// Scripted language model recording every prompt it receives
pub struct FakeModel {
    id: String,
    responder: Box<Responder>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeModel {
    pub fn new<F>(id: &str, responder: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            responder: Box::new(responder),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn replying(id: &str, reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(id, move |_| Ok(reply.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls that were ever running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn call(&self, prompt: &str, cancel: &CancelToken) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            cancel
                .run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
        }
        cancel.check()?;
        (self.responder)(prompt)
    }
}

/// Decrements the in-flight count however the call ends
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Repository row for tests that never touch the relational store
pub fn repository(local_path: &std::path::Path, collection: &str) -> crate::database::Repository {
    crate::database::Repository {
        id: 1,
        full_name: "acme/widgets".to_string(),
        clone_url: "https://example.com/acme/widgets.git".to_string(),
        local_path: local_path.to_string_lossy().to_string(),
        collection_name: collection.to_string(),
        embedder_model: "fake".to_string(),
        last_indexed_sha: None,
        created_at: chrono::NaiveDateTime::default(),
        updated_at: chrono::NaiveDateTime::default(),
    }
}

/// Embed and store documents the way the indexer does
pub async fn seed(
    index: &dyn crate::database::VectorIndex,
    embedder: &FakeEmbedder,
    collection: &str,
    documents: Vec<crate::database::IndexedDocument>,
) {
    let mut stored = Vec::with_capacity(documents.len());
    for mut document in documents {
        document.vector = embedder.vector(&document.content);
        document.sparse = Some(embedder.sparse(&document.content));
        stored.push(document);
    }
    index
        .add_documents(collection, stored)
        .await
        .expect("can seed index");
}
