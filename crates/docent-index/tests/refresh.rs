use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use docent_index::store::connect;
use docent_index::{
    ChunkId, ChunkStore, Chunker, ChunkerConfig, HybridRanker, RankerConfig, RefreshOutcome,
    RefreshReport, SourceUrls, Updater,
};
use docent_llm::mock::MockProvider;

struct Fixture {
    store: Arc<ChunkStore>,
    updater: Updater<MockProvider>,
    ranker: HybridRanker<MockProvider>,
}

async fn fixture(provider: MockProvider) -> Fixture {
    let store = Arc::new(
        ChunkStore::open(connect(":memory:").await.unwrap())
            .await
            .unwrap(),
    );
    let provider = Arc::new(provider);
    let chunker = Chunker::new(
        ChunkerConfig {
            max_chars: 400,
            min_overlap_chars: 40,
        },
        SourceUrls::new(Some("https://docs.example.org")).unwrap(),
    )
    .unwrap();
    Fixture {
        updater: Updater::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            chunker,
            vec!["md".into()],
        ),
        ranker: HybridRanker::new(Arc::clone(&store), provider, RankerConfig::default()),
        store,
    }
}

async fn refresh(f: &Fixture, root: &Path) -> RefreshReport {
    match f.updater.refresh(root).await.unwrap() {
        RefreshOutcome::Completed(report) => report,
        RefreshOutcome::AlreadyRunning => panic!("refresh unexpectedly skipped"),
    }
}

/// Every indexed chunk with its document, vector and keyword postings, sorted by id.
type Snapshot = Vec<(ChunkId, String, Vec<f32>, Vec<(String, u32)>)>;

async fn snapshot(store: &ChunkStore) -> Snapshot {
    let mut snap = Vec::new();
    for id in store.embedding_index().ids() {
        let path = store.get(&id).unwrap().path.clone();
        let vector = store.embedding_index().get(&id).unwrap().to_vec();
        let terms = store.keyword_index().terms(&id).await.unwrap().unwrap();
        snap.push((id, path, vector, terms));
    }
    snap
}

fn touch(path: &Path) {
    touch_after(path, 60);
}

fn touch_after(path: &Path, secs: u64) {
    let later = SystemTime::now() + Duration::from_secs(secs);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(later)
        .unwrap();
}

fn write_corpus(root: &Path) {
    std::fs::write(
        root.join("jobs.md"),
        "# Jobs\nAllocations: use `sbatch` for batch jobs.\n",
    )
    .unwrap();
    std::fs::write(
        root.join("login.md"),
        "# Login nodes\nDo not run heavy computations on login nodes.\n",
    )
    .unwrap();
    std::fs::create_dir_all(root.join("storage")).unwrap();
    std::fs::write(
        root.join("storage/index.md"),
        "# Scratch\nThe scratch filesystem is purged after eight weeks.\n\n\
         # Home\nHome directories have a 40 GB quota.\n",
    )
    .unwrap();
}

#[tokio::test]
async fn empty_root_leaves_empty_index() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(MockProvider::default()).await;

    let report = refresh(&f, dir.path()).await;
    assert_eq!(report.documents_scanned, 0);
    assert!(report.errors.is_empty());
    assert!(f.store.is_empty());
    assert!(f.store.embedding_index().is_empty());
    assert!(f.store.keyword_index().is_empty().await.unwrap());
    assert!(f.ranker.retrieve("anything", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn single_sbatch_chunk_is_top_result() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("allocations.md"),
        "Allocations: use `sbatch` for batch jobs.",
    )
    .unwrap();
    let f = fixture(MockProvider::default()).await;
    refresh(&f, dir.path()).await;
    assert_eq!(f.store.len(), 1);

    let results = f
        .ranker
        .retrieve("how do I submit a batch job", 1)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].chunk.text.contains("sbatch"));
    assert_eq!(results[0].chunk.url, "https://docs.example.org/allocations/");
}

#[tokio::test]
async fn sbatch_chunk_outranks_unrelated_documents() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = fixture(MockProvider::default()).await;
    refresh(&f, dir.path()).await;

    let results = f
        .ranker
        .retrieve("how do I submit a batch job", 1)
        .await
        .unwrap();
    assert_eq!(results[0].chunk.path, "jobs.md");
    assert_eq!(results[0].chunk.url, "https://docs.example.org/jobs/#jobs");
}

#[tokio::test]
async fn refresh_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = fixture(MockProvider::default()).await;

    let first = refresh(&f, dir.path()).await;
    assert_eq!(first.documents_updated, 3);
    let before = snapshot(&f.store).await;
    assert_eq!(before.len(), 4);

    let second = refresh(&f, dir.path()).await;
    assert_eq!(second.documents_unchanged, 3);
    assert_eq!(second.documents_updated, 0);
    assert_eq!(second.chunks_embedded, 0);
    assert_eq!(snapshot(&f.store).await, before);
}

#[tokio::test]
async fn changing_one_document_leaves_others_untouched() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = fixture(MockProvider::default()).await;
    refresh(&f, dir.path()).await;

    let unrelated = |s: &Snapshot| {
        s.iter()
            .filter(|(_, path, _, _)| path != "login.md")
            .cloned()
            .collect::<Vec<_>>()
    };
    let before = snapshot(&f.store).await;

    let login = dir.path().join("login.md");
    std::fs::write(&login, "# Login nodes\nUse compute nodes for builds.\n").unwrap();
    touch(&login);
    let report = refresh(&f, dir.path()).await;
    assert_eq!(report.documents_updated, 1);
    assert_eq!(report.documents_unchanged, 2);

    let after = snapshot(&f.store).await;
    assert_eq!(unrelated(&after), unrelated(&before));
    let login_ids = |s: &Snapshot| {
        s.iter()
            .filter(|(_, path, _, _)| path == "login.md")
            .map(|(id, _, _, _)| id.clone())
            .collect::<Vec<_>>()
    };
    assert_ne!(login_ids(&after), login_ids(&before));
    assert_eq!(login_ids(&after).len(), 1);
}

#[tokio::test]
async fn retrieval_is_deterministic_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = fixture(MockProvider::default()).await;
    refresh(&f, dir.path()).await;

    let ids = |r: &docent_index::RankedResult| {
        r.iter()
            .map(|s| (s.chunk.id.clone(), s.score.to_bits()))
            .collect::<Vec<_>>()
    };
    let first = f.ranker.retrieve("scratch quota", 4).await.unwrap();
    let second = f.ranker.retrieve("scratch quota", 4).await.unwrap();
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn overlapping_refreshes_run_once() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = fixture(MockProvider::default()).await;

    let (a, b) = tokio::join!(f.updater.refresh(dir.path()), f.updater.refresh(dir.path()));
    let outcomes = [a.unwrap(), b.unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, RefreshOutcome::Completed(_)))
        .count();
    assert_eq!(completed, 1);
    assert!(outcomes.contains(&RefreshOutcome::AlreadyRunning));
    assert_eq!(f.store.len(), 4);
}

#[tokio::test]
async fn index_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    write_corpus(&docs);
    let db = dir.path().join("index.db");
    let db = db.to_str().unwrap();

    let before = {
        let store = Arc::new(ChunkStore::open(connect(db).await.unwrap()).await.unwrap());
        let provider = Arc::new(MockProvider::default());
        let updater = Updater::new(
            Arc::clone(&store),
            provider,
            Chunker::new(ChunkerConfig::default(), SourceUrls::default()).unwrap(),
            vec!["md".into()],
        );
        updater.refresh(&docs).await.unwrap();
        let snap = snapshot(&store).await;
        store.pool().close().await;
        snap
    };

    let store = ChunkStore::open(connect(db).await.unwrap()).await.unwrap();
    assert_eq!(snapshot(&store).await, before);
    for (path, _) in store.documents().await.unwrap() {
        assert!(!store.is_stale(&path, 0).await.unwrap());
    }
}

#[tokio::test]
async fn refresh_through_another_connection_reaches_a_serving_ranker() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    write_corpus(&docs);
    let db = dir.path().join("index.db");
    let db = db.to_str().unwrap();
    let provider = Arc::new(MockProvider::default());

    let serving = Arc::new(ChunkStore::open(connect(db).await.unwrap()).await.unwrap());
    let ranker = HybridRanker::new(
        Arc::clone(&serving),
        Arc::clone(&provider),
        RankerConfig::default(),
    );

    let writer = Arc::new(ChunkStore::open(connect(db).await.unwrap()).await.unwrap());
    let updater = Updater::new(
        writer,
        provider,
        Chunker::new(ChunkerConfig::default(), SourceUrls::default()).unwrap(),
        vec!["md".into()],
    );
    updater.refresh(&docs).await.unwrap();
    assert!(
        ranker
            .retrieve("how do I submit a batch job", 1)
            .await
            .unwrap()
            .is_empty()
    );

    assert_eq!(serving.sync().await.unwrap(), 3);
    let results = ranker
        .retrieve("how do I submit a batch job", 1)
        .await
        .unwrap();
    assert_eq!(results[0].chunk.path, "jobs.md");

    std::fs::remove_file(docs.join("jobs.md")).unwrap();
    updater.refresh(&docs).await.unwrap();
    assert_eq!(serving.sync().await.unwrap(), 1);
    let results = ranker.retrieve("sbatch batch jobs", 4).await.unwrap();
    assert!(results.iter().all(|s| s.chunk.path != "jobs.md"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retrieval_during_refresh_sees_whole_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let f = Arc::new(fixture(MockProvider::default()).await);
    refresh(&f, dir.path()).await;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let f = Arc::clone(&f);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut rounds = 0usize;
            while rounds == 0 || !stop.load(Ordering::SeqCst) {
                let results = f
                    .ranker
                    .retrieve("sbatch batch jobs revision", 4)
                    .await
                    .unwrap();
                for scored in &results {
                    let chunk = &scored.chunk;
                    assert_eq!(chunk.id, ChunkId::derive(&chunk.path, chunk.seq, &chunk.text));
                    // a chunk superseded after this retrieval is simply gone
                    if let Some(current) = f.store.get(&chunk.id) {
                        assert_eq!(current.text, chunk.text);
                        assert_eq!(current.path, chunk.path);
                    }
                }
                rounds += 1;
                tokio::task::yield_now().await;
            }
            rounds
        })
    };

    let jobs = dir.path().join("jobs.md");
    for revision in 0..10u64 {
        std::fs::write(
            &jobs,
            format!("# Jobs\nAllocations: use `sbatch` for batch jobs, revision {revision}.\n"),
        )
        .unwrap();
        touch_after(&jobs, 60 + revision);
        let report = refresh(&f, dir.path()).await;
        assert_eq!(report.documents_updated, 1);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }
    stop.store(true, Ordering::SeqCst);
    assert!(reader.await.unwrap() > 0);

    let results = f.ranker.retrieve("sbatch revision", 1).await.unwrap();
    assert!(results[0].chunk.text.contains("revision 9"));
    assert_eq!(f.store.keyword_index().len().await.unwrap(), f.store.len());
}
