use std::sync::Arc;

use docent_index::store::connect;
use docent_index::{
    Chunk, ChunkStore, Chunker, ChunkerConfig, HybridRanker, RankerConfig, SourceUrls,
};
use docent_llm::mock::{MockProvider, bag_of_words};

use crate::answer::{AnswerConfig, QuestionAnswerer};

pub const ALLOCATIONS: &str = "Allocations: use `sbatch` for batch jobs.";
pub const URL: &str = "https://docs.example.org/allocations/";

/// Chunks of the allocations page with the mock provider's vectors.
pub fn allocation_entries(provider: &MockProvider) -> Vec<(Chunk, Vec<f32>)> {
    let chunker = Chunker::new(
        ChunkerConfig::default(),
        SourceUrls::new(Some("https://docs.example.org")).unwrap(),
    )
    .unwrap();
    chunker
        .split("allocations.md", ALLOCATIONS)
        .into_iter()
        .map(|c| {
            let v = bag_of_words(&c.text, provider.dimension);
            (c, v)
        })
        .collect()
}

/// Answerer over an in-memory index holding the allocations page.
pub async fn answerer(provider: &MockProvider, config: AnswerConfig) -> QuestionAnswerer<MockProvider> {
    let store = Arc::new(
        ChunkStore::open(connect(":memory:").await.unwrap())
            .await
            .unwrap(),
    );
    store
        .upsert_document("allocations.md", 1, allocation_entries(provider))
        .await
        .unwrap();
    answerer_over(store, provider, config)
}

pub fn answerer_over(
    store: Arc<ChunkStore>,
    provider: &MockProvider,
    config: AnswerConfig,
) -> QuestionAnswerer<MockProvider> {
    let provider = Arc::new(provider.clone());
    let ranker = Arc::new(HybridRanker::new(
        store,
        Arc::clone(&provider),
        RankerConfig::default(),
    ));
    QuestionAnswerer::new(ranker, provider, config)
}
