//! Handler compilation and bytecode caching.
//!
//! Handlers are compiled to engine bytecode once and cached in two tiers:
//! an in-memory LRU bounded by a byte budget, and an optional disk tier
//! bounded by total size with last-access eviction. Entries are keyed by
//! fingerprint: a hash over the engine version tag and the source, so an
//! engine upgrade rolls the whole cache over.
//!
//! Admission is single-flight per fingerprint: concurrent compiles of the
//! same source coalesce onto one underlying compilation.

use crate::engine::binding::EngineBinding;
use crate::error::{Result, RuntimeError};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A compiled handler ready for execution
#[derive(Clone)]
pub struct CompiledHandler {
    /// Fingerprint: hex SHA-256 over version tag and source
    pub fingerprint: String,
    /// Engine bytecode
    pub bytecode: Arc<Vec<u8>>,
    /// Source map for error enrichment (absent for disk-tier loads and
    /// host-supplied bytecode)
    pub source_map: Option<SourceMap>,
    /// Whether this lookup hit a cache tier
    pub cache_hit: bool,
}

impl CompiledHandler {
    /// Reconstruct a compiled handler from bytecode the host persisted
    /// itself. The fingerprint is derived from the bytes under a distinct
    /// domain so it cannot collide with source fingerprints.
    pub fn from_bytecode(version_tag: &str, bytecode: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(version_tag.as_bytes());
        hasher.update(b"\0bytecode\0");
        hasher.update(&bytecode);

        Self {
            fingerprint: hex::encode(hasher.finalize()),
            bytecode: Arc::new(bytecode),
            source_map: None,
            cache_hit: true,
        }
    }
}

/// Compute the fingerprint for a handler source under an engine version tag
pub fn fingerprint(version_tag: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_tag.as_bytes());
    hasher.update(b"\0");
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Source map for error location enrichment
#[derive(Clone, Debug)]
pub struct SourceMap {
    /// Original source
    pub source: String,
    /// Byte offsets of line starts
    pub line_offsets: Vec<usize>,
}

impl SourceMap {
    /// Build a source map from handler source
    pub fn from_source(source: &str) -> Self {
        let mut line_offsets = vec![0];
        for (i, c) in source.char_indices() {
            if c == '\n' {
                line_offsets.push(i + 1);
            }
        }

        Self {
            source: source.to_string(),
            line_offsets,
        }
    }

    /// Line and column (1-indexed) for a byte offset
    pub fn location(&self, offset: usize) -> (usize, usize) {
        let line = self
            .line_offsets
            .iter()
            .position(|&o| o > offset)
            .unwrap_or(self.line_offsets.len())
            .saturating_sub(1);

        let col = offset - self.line_offsets.get(line).copied().unwrap_or(0);
        (line + 1, col + 1)
    }

    /// A few lines of source around `line`, with a marker on it
    pub fn snippet(&self, line: usize, context_lines: usize) -> String {
        let lines: Vec<&str> = self.source.lines().collect();
        let start = line.saturating_sub(context_lines + 1);
        let end = (line + context_lines).min(lines.len());

        lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let line_num = start + i + 1;
                let marker = if line_num == line { ">" } else { " " };
                format!("{} {:4} | {}", marker, line_num, l)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct CacheEntry {
    bytecode: Arc<Vec<u8>>,
    source_map: Option<SourceMap>,
    last_accessed: Instant,
    size: u64,
}

impl CacheEntry {
    fn new(bytecode: Arc<Vec<u8>>, source_map: Option<SourceMap>) -> Self {
        let size =
            (bytecode.len() + source_map.as_ref().map_or(0, |s| s.source.len())) as u64;
        Self {
            bytecode,
            source_map,
            last_accessed: Instant::now(),
            size,
        }
    }
}

/// Handler compiler with two-tier caching
pub struct HandlerCompiler {
    binding: Arc<dyn EngineBinding>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_size: AtomicU64,
    max_cache_bytes: u64,
    disk: Option<DiskCache>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_compilations: AtomicU64,
}

impl HandlerCompiler {
    /// Create a compiler over an engine binding.
    ///
    /// `cache_dir` enables the disk tier; the directory is created if
    /// missing.
    pub fn new(
        binding: Arc<dyn EngineBinding>,
        max_cache_bytes: u64,
        cache_dir: Option<PathBuf>,
        max_disk_cache_bytes: u64,
    ) -> Result<Self> {
        let disk = match cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                Some(DiskCache {
                    dir,
                    max_bytes: max_disk_cache_bytes,
                })
            }
            None => None,
        };

        info!(
            disk_cache = disk.is_some(),
            max_cache_bytes, "initialized handler compiler"
        );

        Ok(Self {
            binding,
            cache: RwLock::new(HashMap::new()),
            cache_size: AtomicU64::new(0),
            max_cache_bytes,
            disk,
            inflight: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            total_compilations: AtomicU64::new(0),
        })
    }

    /// Compile handler source, consulting both cache tiers first.
    ///
    /// Failures surface immediately and leave no cache entry in either
    /// tier.
    pub async fn compile(&self, source: &str) -> Result<CompiledHandler> {
        let fp = fingerprint(self.binding.version_tag(), source);

        if let Some(compiled) = self.lookup_memory(&fp) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fp, "compile cache hit (memory)");
            return Ok(compiled);
        }

        // Single-flight: followers for the same fingerprint wait here and
        // then find the leader's result in the memory tier.
        let gate = self
            .inflight
            .entry(fp.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(compiled) = self.lookup_memory(&fp) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fp, "compile cache hit (coalesced)");
            self.inflight.remove(&fp);
            return Ok(compiled);
        }

        if let Some(bytecode) = self.lookup_disk(&fp) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fp, "compile cache hit (disk)");
            let bytecode = Arc::new(bytecode);
            self.insert_memory(&fp, Arc::clone(&bytecode), None);
            self.inflight.remove(&fp);
            return Ok(CompiledHandler {
                fingerprint: fp,
                bytecode,
                source_map: None,
                cache_hit: true,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.total_compilations.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fp, "compile cache miss, compiling");

        let source_map = SourceMap::from_source(source);
        let bytecode = match self.binding.compile(source) {
            Ok(bytes) => Arc::new(bytes),
            Err(mut err) => {
                // Enrich the compile error with a snippet before surfacing.
                if let Some(loc) = err.location.clone() {
                    if err.snippet.is_none() {
                        let snippet = source_map.snippet(loc.line as usize, 2);
                        err = err.with_snippet(snippet, loc.line);
                    }
                }
                self.inflight.remove(&fp);
                return Err(RuntimeError::Handler(err));
            }
        };

        if let Some(disk) = &self.disk {
            disk.store(&fp, &bytecode);
        }
        self.insert_memory(&fp, Arc::clone(&bytecode), Some(source_map.clone()));
        self.inflight.remove(&fp);

        Ok(CompiledHandler {
            fingerprint: fp,
            bytecode,
            source_map: Some(source_map),
            cache_hit: false,
        })
    }

    fn lookup_memory(&self, fp: &str) -> Option<CompiledHandler> {
        let mut cache = self.cache.write();
        let entry = cache.get_mut(fp)?;
        entry.last_accessed = Instant::now();

        Some(CompiledHandler {
            fingerprint: fp.to_string(),
            bytecode: Arc::clone(&entry.bytecode),
            source_map: entry.source_map.clone(),
            cache_hit: true,
        })
    }

    fn insert_memory(&self, fp: &str, bytecode: Arc<Vec<u8>>, source_map: Option<SourceMap>) {
        let entry = CacheEntry::new(bytecode, source_map);
        let entry_size = entry.size;

        while self.cache_size.load(Ordering::Relaxed) + entry_size > self.max_cache_bytes {
            if !self.evict_lru() {
                break;
            }
        }

        let mut cache = self.cache.write();
        if let Some(old) = cache.insert(fp.to_string(), entry) {
            self.cache_size.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.cache_size.fetch_add(entry_size, Ordering::Relaxed);
    }

    fn evict_lru(&self) -> bool {
        let mut cache = self.cache.write();

        let lru_key = cache
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone());

        match lru_key {
            Some(key) => {
                if let Some(entry) = cache.remove(&key) {
                    self.cache_size.fetch_sub(entry.size, Ordering::Relaxed);
                    debug!(fingerprint = %key, "evicted compile cache entry");
                }
                true
            }
            None => false,
        }
    }

    fn lookup_disk(&self, fp: &str) -> Option<Vec<u8>> {
        let disk = self.disk.as_ref()?;
        disk.load(fp)
    }

    /// Cache statistics
    pub fn stats(&self) -> CompilerStats {
        CompilerStats {
            entries: self.cache.read().len(),
            size_bytes: self.cache_size.load(Ordering::Relaxed),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            compilations: self.total_compilations.load(Ordering::Relaxed),
        }
    }

    /// Clear both cache tiers
    pub fn clear(&self) {
        self.cache.write().clear();
        self.cache_size.store(0, Ordering::Relaxed);
        if let Some(disk) = &self.disk {
            disk.clear();
        }
        info!("cleared compile caches");
    }
}

/// Disk tier: one file per fingerprint, hex name, no index. The directory
/// listing plus mtimes is authoritative.
struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
}

impl DiskCache {
    fn entry_path(&self, fp: &str) -> PathBuf {
        self.dir.join(fp)
    }

    fn load(&self, fp: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(fp);
        let bytes = std::fs::read(&path).ok()?;
        // Touch so last-access pruning keeps warm entries. Rewriting is the
        // portable way to bump mtime; atime is unreliable under relatime.
        if let Err(e) = write_atomic(&self.dir, &path, &bytes) {
            warn!(path = %path.display(), error = %e, "failed to touch disk cache entry");
        }
        debug!(path = %path.display(), "loaded from disk cache");
        Some(bytes)
    }

    fn store(&self, fp: &str, bytecode: &[u8]) {
        let path = self.entry_path(fp);
        if let Err(e) = write_atomic(&self.dir, &path, bytecode) {
            warn!(path = %path.display(), error = %e, "failed to write disk cache");
            return;
        }
        debug!(path = %path.display(), "wrote to disk cache");
        self.prune();
    }

    /// Remove oldest-mtime entries until the directory fits the budget.
    fn prune(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if name.starts_with('.') {
                    return None;
                }
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((path, meta.modified().ok()?, meta.len()))
            })
            .collect();

        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
        if total <= self.max_bytes {
            return;
        }

        files.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, len) in files {
            if total <= self.max_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "pruned disk cache entry");
                total = total.saturating_sub(len);
            }
        }
    }

    fn clear(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Write-temp-then-rename so readers never observe a partial entry.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Compiler cache statistics
#[derive(Debug, Clone)]
pub struct CompilerStats {
    /// In-memory entries
    pub entries: usize,
    /// In-memory bytes
    pub size_bytes: u64,
    /// Lookups that hit a cache tier
    pub hits: u64,
    /// Lookups that compiled
    pub misses: u64,
    /// Underlying compilations performed
    pub compilations: u64,
}

impl CompilerStats {
    /// Cache hit rate (0-1)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedBinding;

    fn compiler_with(max_cache_bytes: u64, dir: Option<PathBuf>) -> HandlerCompiler {
        HandlerCompiler::new(
            Arc::new(ScriptedBinding::new()),
            max_cache_bytes,
            dir,
            64 * 1024,
        )
        .expect("compiler")
    }

    fn src(label: &str) -> String {
        format!(r#"[{{"op":"returnValue","value":"{}"}}]"#, label)
    }

    #[tokio::test]
    async fn test_compile_deterministic() {
        let compiler = compiler_with(1024 * 1024, None);

        let first = compiler.compile(&src("a")).await.unwrap();
        compiler.clear();
        let second = compiler.compile(&src("a")).await.unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.bytecode, second.bytecode);
    }

    #[tokio::test]
    async fn test_memory_cache_hit() {
        let compiler = compiler_with(1024 * 1024, None);
        let source = src("a");

        assert!(!compiler.compile(&source).await.unwrap().cache_hit);
        assert!(compiler.compile(&source).await.unwrap().cache_hit);

        let stats = compiler.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.compilations, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_compile_error_leaves_no_entry() {
        let compiler = compiler_with(1024 * 1024, None);

        let result = compiler.compile("not json").await;
        assert!(result.is_err());
        assert_eq!(compiler.stats().entries, 0);

        // A second attempt compiles again rather than hitting a cache.
        assert!(compiler.compile("not json").await.is_err());
        assert_eq!(compiler.stats().compilations, 2);
    }

    #[tokio::test]
    async fn test_eviction_and_disk_promotion() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = src("aaaaaaaa");
        let b = src("bbbbbbbb");
        // Budget fits one compiled entry (bytecode + source map) but not two.
        let budget = (a.len() * 3) as u64;
        let compiler = compiler_with(budget, Some(tmp.path().to_path_buf()));

        assert!(!compiler.compile(&a).await.unwrap().cache_hit); // miss, compiles
        assert!(!compiler.compile(&b).await.unwrap().cache_hit); // miss, evicts a from memory
        assert_eq!(compiler.stats().entries, 1);

        // a is gone from memory but retained on disk.
        let again = compiler.compile(&a).await.unwrap();
        assert!(again.cache_hit);
        assert_eq!(compiler.stats().compilations, 2);
    }

    #[tokio::test]
    async fn test_disk_layout_one_file_per_fingerprint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let compiler = compiler_with(1024 * 1024, Some(tmp.path().to_path_buf()));

        let compiled = compiler.compile(&src("a")).await.unwrap();
        let path = tmp.path().join(&compiled.fingerprint);
        let on_disk = std::fs::read(&path).expect("disk entry");
        assert_eq!(on_disk, *compiled.bytecode);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces() {
        let compiler = Arc::new(compiler_with(1024 * 1024, None));
        let source = src("shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let compiler = Arc::clone(&compiler);
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                compiler.compile(&source).await.map(|c| c.fingerprint)
            }));
        }

        let mut fingerprints = Vec::new();
        for handle in handles {
            fingerprints.push(handle.await.expect("join").expect("compile"));
        }
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), 1);

        // All eight lookups resolved with a single compilation.
        assert_eq!(compiler.stats().compilations, 1);
    }

    #[test]
    fn test_source_map_locations() {
        let map = SourceMap::from_source("line1\nline2\nline3");

        assert_eq!(map.location(0), (1, 1));
        assert_eq!(map.location(6), (2, 1));
        assert_eq!(map.location(13), (3, 2));
    }

    #[test]
    fn test_source_map_snippet() {
        let map = SourceMap::from_source("line1\nline2\nline3\nline4\nline5");
        let snippet = map.snippet(3, 1);

        assert!(snippet.contains("line2"));
        assert!(snippet.contains("> "));
        assert!(snippet.contains("line4"));
        assert!(!snippet.contains("line5"));
    }

    #[test]
    fn test_from_bytecode_distinct_domain() {
        let source = src("x");
        let from_source = fingerprint("tag", &source);
        let from_bytes = CompiledHandler::from_bytecode("tag", source.into_bytes());
        assert_ne!(from_source, from_bytes.fingerprint);
    }
}
