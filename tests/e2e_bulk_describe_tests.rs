//! End-to-end tests for bulk CSV describe
//!
//! A CSV batch is validated, turned into sounds and pushed through the
//! worker to fully processed state.

mod common;

use common::{write_sine_wav, TestPipeline};
use sound_pipeline::bulk::{BulkDescribeOptions, BulkDescriber};
use sound_pipeline::dispatch::PROCESS_QUEUE;
use sound_pipeline::sounds::{ProcessingState, SoundStore};
use std::path::PathBuf;

const HEADER: &str = "audio_filename,name,tags,geotag,description,license,pack_name,is_explicit";

fn write_batch(pipeline: &TestPipeline, lines: &[&str]) -> PathBuf {
    let csv = pipeline.upload_root().join("batch.csv");
    std::fs::write(&csv, format!("{}\n{}\n", HEADER, lines.join("\n"))).unwrap();
    csv
}

fn options() -> BulkDescribeOptions {
    BulkDescribeOptions {
        username: Some("uploader".to_string()),
        ..BulkDescribeOptions::default()
    }
}

#[tokio::test]
async fn test_bulk_batch_is_created_and_processed() {
    let pipeline = TestPipeline::spawn();
    write_sine_wav(&pipeline.upload_root().join("rain.wav"), 440.0);
    write_sine_wav(&pipeline.upload_root().join("wind.wav"), 660.0);
    let csv = write_batch(
        &pipeline,
        &[
            "rain.wav,Rain,field rain nature,,heavy rain,Creative Commons 0,Ambience,0",
            "wind.wav,,storm wind nature,,,Attribution,Ambience,0",
        ],
    );

    let describer = BulkDescriber::new(pipeline.store.clone(), pipeline.dispatcher.clone());
    let report = describer
        .describe_from_csv(&csv, pipeline.upload_root(), &options())
        .unwrap();
    assert!(report.global_errors.is_empty());
    assert!(report.line_errors.is_empty());
    assert_eq!(report.created.len(), 2);
    assert_eq!(pipeline.dispatcher.queue_depth(PROCESS_QUEUE).unwrap(), 2);

    assert_eq!(pipeline.drain().await, 2);

    let mut pack_id = None;
    for sound_id in &report.created {
        let sound = pipeline.store.get_sound(*sound_id).unwrap().unwrap();
        assert_eq!(sound.processing_state, ProcessingState::Ok);
        pack_id = sound.pack_id;
    }
    // both lines named the same pack
    let pack = pipeline.store.get_pack(pack_id.unwrap()).unwrap().unwrap();
    assert_eq!(pack.name, "Ambience");

    // the name defaulted to the filename on the second line
    let second = pipeline
        .store
        .get_sound(report.created[1])
        .unwrap()
        .unwrap();
    assert_eq!(second.name, "wind.wav");
}

#[tokio::test]
async fn test_bulk_batch_rejected_when_one_line_is_invalid() {
    let pipeline = TestPipeline::spawn();
    write_sine_wav(&pipeline.upload_root().join("rain.wav"), 440.0);
    let csv = write_batch(
        &pipeline,
        &[
            "rain.wav,Rain,field rain nature,,d,Creative Commons 0,,0",
            "gone.wav,,storm wind nature,,,Attribution,,0",
        ],
    );

    let describer = BulkDescriber::new(pipeline.store.clone(), pipeline.dispatcher.clone());
    let report = describer
        .describe_from_csv(&csv, pipeline.upload_root(), &options())
        .unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.line_errors.len(), 1);
    assert_eq!(report.line_errors[0].0, 3);
    assert_eq!(pipeline.dispatcher.queue_depth(PROCESS_QUEUE).unwrap(), 0);
}

#[tokio::test]
async fn test_bulk_force_import_processes_the_valid_lines() {
    let pipeline = TestPipeline::spawn();
    write_sine_wav(&pipeline.upload_root().join("rain.wav"), 440.0);
    let csv = write_batch(
        &pipeline,
        &[
            "rain.wav,Rain,field rain nature,,d,Creative Commons 0,,0",
            "gone.wav,,storm wind nature,,,Attribution,,0",
        ],
    );

    let describer = BulkDescriber::new(pipeline.store.clone(), pipeline.dispatcher.clone());
    let report = describer
        .describe_from_csv(
            &csv,
            pipeline.upload_root(),
            &BulkDescribeOptions {
                force_import: true,
                ..options()
            },
        )
        .unwrap();
    assert_eq!(report.created.len(), 1);

    pipeline.drain().await;
    let sound = pipeline
        .store
        .get_sound(report.created[0])
        .unwrap()
        .unwrap();
    assert_eq!(sound.processing_state, ProcessingState::Ok);
}
