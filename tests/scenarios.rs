//! End-to-end behavior through the public API.

use boundzip::{
    ArchiveEntry, ArchiveStreamExtractor, BackpressureHandler, ChunkOptions, ChunkedProcessor,
    EntryFilter, EntryHandler, EntryRecord, Error, ExtractOptions, FilterCriteria, LocalFileReader,
    MemoryBudget, MemoryMonitor, MemoryProbe, ZipArchiveReader, config::BackpressureConfig,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

struct ScriptedProbe(AtomicU64);

impl MemoryProbe for ScriptedProbe {
    fn current_usage(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn monitor(limit: u64, usage: u64) -> Arc<MemoryMonitor> {
    Arc::new(MemoryMonitor::new(
        MemoryBudget::new(limit),
        Arc::new(ScriptedProbe(AtomicU64::new(usage))),
    ))
}

fn build_zip(files: &[(&str, &[u8])], dirs: &[&str]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    for dir in dirs {
        writer.add_directory(*dir, options).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn size_filter_keeps_small_file_and_directory() {
    let data = build_zip(&[("a.txt", &[b'a'; 10]), ("b.bin", &vec![0u8; 500_000])], &["dir/"]);
    let filter =
        EntryFilter::new(FilterCriteria::default().with_size_bounds(None, Some(1000))).unwrap();
    let options = ExtractOptions::default()
        .with_monitor(monitor(50 * 1024 * 1024, 1024))
        .with_filter(filter);

    let entries = ArchiveStreamExtractor::new(options)
        .unwrap()
        .extract(data)
        .await
        .unwrap();

    let names: Vec<_> = entries.iter().map(|e| e.name()).collect();
    assert_eq!(names, ["a.txt", "dir/"]);
}

#[tokio::test]
async fn zero_budget_rejects_extraction_and_chunking() {
    let data = build_zip(&[("a.txt", b"hello")], &[]);
    let options = ExtractOptions::default().with_monitor(monitor(0, 0));
    let err = ArchiveStreamExtractor::new(options)
        .unwrap()
        .extract(data)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MemoryBudgetExceeded { .. }));

    let chunker = ChunkedProcessor::new(monitor(0, 0));
    assert!(matches!(
        chunker.process_in_chunks(vec![1u8; 10], 4, &ChunkOptions::default()),
        Err(Error::MemoryBudgetExceeded { .. })
    ));
}

#[test]
fn chunking_splits_with_short_tail() {
    let chunker = ChunkedProcessor::new(monitor(u64::MAX, 0));
    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();

    let result = chunker
        .process_in_chunks(data.clone(), 300, &ChunkOptions::default())
        .unwrap();

    let lengths: Vec<_> = result.chunks.iter().map(|c| c.len()).collect();
    assert_eq!(lengths, [300, 300, 300, 100]);
    assert_eq!(result.total_size, 1000);
    assert_eq!(result.concat(), data);
}

#[test]
fn traversal_is_rejected_even_with_catch_all_include() {
    let filter = EntryFilter::new(FilterCriteria::default().include("**/*")).unwrap();

    for name in [
        "../../etc/passwd",
        "a/..\\b",
        "/etc/passwd",
        "C:\\Windows\\win.ini",
        "nul\0byte",
    ] {
        assert!(
            !filter.matches(&EntryRecord::new(name, 10, false)),
            "{name:?} should be rejected"
        );
    }
    assert!(filter.matches(&EntryRecord::new("safe/file.txt", 10, false)));
}

#[tokio::test(start_paused = true)]
async fn producer_waits_for_first_read_and_then_for_consumer() {
    let handler = BackpressureHandler::new(monitor(u64::MAX, 0), BackpressureConfig::default());
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = pulled.clone();
    let source = stream::iter(0..10).map(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(vec![0u8; 2048]))
    });

    let mut controlled = handler.apply_backpressure(source, 1024);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pulled.load(Ordering::SeqCst), 0);

    controlled.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pulled.load(Ordering::SeqCst), 2);
    assert_eq!(controlled.buffered_bytes(), 2048);

    let mut units = 1;
    while let Some(unit) = controlled.next().await {
        assert_eq!(unit.unwrap().len(), 2048);
        units += 1;
    }
    assert_eq!(units, 10);
}

struct CountingHandler {
    bytes: AtomicU64,
}

#[async_trait::async_trait]
impl EntryHandler for CountingHandler {
    async fn handle(&self, mut entry: ArchiveEntry) -> boundzip::Result<()> {
        let read = entry.content().drain().await?;
        assert_eq!(read, entry.uncompressed_size());
        self.bytes.fetch_add(read, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn local_file_extraction_matches_declared_sizes() {
    let contents: Vec<Vec<u8>> = (1..=6)
        .map(|i| b"streaming under a budget ".repeat(i * 2_000))
        .collect();
    let names: Vec<String> = (1..=6).map(|i| format!("logs/part{i}.log")).collect();
    let files: Vec<(&str, &[u8])> = names
        .iter()
        .zip(&contents)
        .map(|(n, c)| (n.as_str(), c.as_slice()))
        .collect();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&build_zip(&files, &["logs/"])).unwrap();
    file.flush().unwrap();

    let archive = ZipArchiveReader::new(Arc::new(LocalFileReader::new(file.path()).unwrap()));
    let mut options = ExtractOptions::default().with_monitor(monitor(u64::MAX, 0));
    options.config.workers = 3;
    options.config.backpressure.high_water_mark = 4096;
    let handler = CountingHandler {
        bytes: AtomicU64::new(0),
    };

    let report = ArchiveStreamExtractor::new(options)
        .unwrap()
        .extract_with_from(&archive, &handler)
        .await
        .unwrap();

    let expected: u64 = contents.iter().map(|c| c.len() as u64).sum();
    assert_eq!(report.entries_processed, 7);
    assert_eq!(report.bytes_declared, expected);
    assert_eq!(handler.bytes.load(Ordering::SeqCst), expected);
}
