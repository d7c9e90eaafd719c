use super::stub::{write_sine_wav, StubTranscoder};
use sound_pipeline::cache::InMemoryCache;
use sound_pipeline::dispatch::{AnalyzerRunner, JobRunner, ProcessorRunner};
use sound_pipeline::orchestrator::{Orchestrator, OrchestratorSettings};
use sound_pipeline::processing::{
    AnalyzerDescriptor, AnalyzerRegistry, DescriptorMapping, DescriptorType,
};
use sound_pipeline::sounds::{NewSound, Sound, SoundStore};
use sound_pipeline::{
    Analyzer, ArtifactStore, JobDispatcher, Processor, SqliteJobQueueStore, SqliteSoundStore,
    Worker,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The analyzer every test pipeline is configured with.
pub const ANALYZER: &str = "ext1";

pub struct TestPipeline {
    pub store: Arc<SqliteSoundStore>,
    pub queue: Arc<SqliteJobQueueStore>,
    pub dispatcher: Arc<JobDispatcher>,
    pub artifacts: ArtifactStore,
    pub transcoder: Arc<StubTranscoder>,
    pub worker: Worker,
    pub user_id: i64,
    data_dir: tempfile::TempDir,
    upload_dir: tempfile::TempDir,
}

fn test_registry() -> AnalyzerRegistry {
    let mut analyzers = BTreeMap::new();
    analyzers.insert(
        ANALYZER.to_string(),
        AnalyzerDescriptor {
            command: vec![
                "stub_extractor".to_string(),
                "{input}".to_string(),
                "{output}".to_string(),
            ],
            max_input_filesize: 0,
            descriptor_map: vec![
                DescriptorMapping {
                    source: "lowlevel.spectral_centroid.mean".to_string(),
                    dest: "spectral_centroid".to_string(),
                    kind: DescriptorType::Float,
                },
                DescriptorMapping {
                    source: "rhythm.bpm".to_string(),
                    dest: "bpm".to_string(),
                    kind: DescriptorType::Float,
                },
            ],
        },
    );
    AnalyzerRegistry::new(analyzers).unwrap()
}

impl TestPipeline {
    pub fn spawn() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let upload_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteSoundStore::in_memory().unwrap());
        let user = store.create_user("uploader").unwrap();
        let queue = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let dispatcher = Arc::new(JobDispatcher::new(queue.clone(), store.clone()));
        let artifacts = ArtifactStore::new(data_dir.path());
        let transcoder = Arc::new(StubTranscoder::new());

        let processor = Arc::new(Processor::new(
            store.clone(),
            artifacts.clone(),
            transcoder.clone(),
            Default::default(),
        ));
        let analyzer = Arc::new(Analyzer::new(
            store.clone(),
            artifacts.clone(),
            transcoder.clone(),
            test_registry(),
        ));
        let runners: Vec<Arc<dyn JobRunner>> = vec![
            Arc::new(ProcessorRunner::new(processor)),
            Arc::new(AnalyzerRunner::new(analyzer, ANALYZER.to_string())),
        ];
        let worker = Worker::new(
            queue.clone(),
            dispatcher.clone(),
            runners,
            Duration::from_millis(10),
        );

        TestPipeline {
            store,
            queue,
            dispatcher,
            artifacts,
            transcoder,
            worker,
            user_id: user.id,
            data_dir,
            upload_dir,
        }
    }

    /// A fresh sound whose original file exists in the upload directory.
    pub fn add_sound(&self, name: &str) -> Sound {
        let upload = self.upload_dir.path().join(format!("{}.wav", name));
        write_sine_wav(&upload, 440.0);
        self.store
            .insert_sound(NewSound {
                user_id: self.user_id,
                pack_id: None,
                name: name.to_string(),
                original_filename: format!("{}.wav", name),
                original_path: Some(upload.to_string_lossy().to_string()),
                content_digest: format!("digest-{}", name),
                sound_type: "wav".to_string(),
                license: "Creative Commons 0".to_string(),
                tags: vec!["field".to_string(), "test".to_string(), "wav".to_string()],
                description: String::new(),
                is_explicit: false,
                geotag: None,
                filesize: 16000,
            })
            .unwrap()
    }

    pub fn orchestrator(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.artifacts.clone(),
            Arc::new(InMemoryCache::new()),
            vec![ANALYZER.to_string()],
            settings,
        )
    }

    /// Run jobs until all queues are empty. Returns how many jobs ran.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while self.worker.run_one().await.unwrap() {
            ran += 1;
        }
        ran
    }

    pub fn data_root(&self) -> &std::path::Path {
        self.data_dir.path()
    }

    pub fn upload_root(&self) -> &std::path::Path {
        self.upload_dir.path()
    }
}
