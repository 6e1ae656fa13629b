// Installation planner: turns a manifest pair into an ordered task
// stream, a download queue and a resource estimate

pub mod filter;
pub mod tasks;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::common::error::{Error, Result};
use crate::common::types::{
    CACHE_PADDING, REORDER_FILE_LIMIT, REORDER_MIN_OVERLAP, REORDER_PART_THRESHOLD,
};
use crate::common::InstallConfig;
use crate::manifest::{FileManifest, Manifest, ManifestComparison};
use crate::storage::journal::ResumeJournal;

pub use tasks::{ChunkSource, ChunkTask, FileTask, Task, TaskFlags};

/// Selection and behavior switches for a single planning run.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Allow reusing bytes from the previous installation's files
    pub patch: bool,
    /// Continue from the resume journal (or probe the disk without one)
    pub resume: bool,
    /// Allow reusing bytes from files already written earlier in the run
    pub read_files: bool,
    /// Greedily pair files sharing many chunks to shrink the cache
    pub processing_optimization: bool,
    /// Only install files starting with one of these prefixes
    pub file_prefix_filter: Vec<String>,
    /// Skip files starting with one of these prefixes
    pub file_exclude_filter: Vec<String>,
    /// Skip files matching one of these configured glob patterns
    pub file_exclude_configured: Vec<String>,
    /// Only install files carrying one of these tags (empty tag selects
    /// untagged files); `None` disables tag selection entirely
    pub file_install_tag: Option<Vec<String>>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            patch: true,
            resume: true,
            read_files: false,
            processing_optimization: false,
            file_prefix_filter: Vec::new(),
            file_exclude_filter: Vec::new(),
            file_exclude_configured: Vec::new(),
            file_install_tag: None,
        }
    }
}

/// Resource summary produced by planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub install_size: u64,
    pub reuse_size: u64,
    pub dl_size: u64,
    pub uncompressed_dl_size: u64,
    pub disk_space_delta: u64,
    pub biggest_chunk: u32,
    pub biggest_file_size: u64,
    /// Simulated cache high-water mark plus padding; the arena must be at
    /// least this large
    pub min_memory: u64,
    pub num_chunks_cache: usize,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// Complete planner output consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub analysis: AnalysisResult,
    pub comparison: ManifestComparison,
    pub tasks: VecDeque<Task>,
    pub chunks_to_dl: VecDeque<u128>,
    /// Manifest content hashes (hex) by filename, the resume journal source
    pub file_hashes: HashMap<String, String>,
}

impl InstallPlan {
    pub fn num_chunk_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.as_chunk().is_some()).count()
    }
}

/// Analyze a manifest against an optional previous install and produce
/// the ordered task stream plus sizing estimate.
pub fn plan_install(
    manifest: &Manifest,
    old_manifest: Option<&Manifest>,
    options: &InstallOptions,
    config: &InstallConfig,
) -> Result<InstallPlan> {
    let files = &manifest.file_manifest_list.elements;

    let mut analysis = AnalysisResult {
        install_size: files.iter().map(|fm| fm.file_size).sum(),
        biggest_chunk: manifest.chunk_data_list.biggest_chunk(),
        biggest_file_size: files.iter().map(|fm| fm.file_size).max().unwrap_or(0),
        ..Default::default()
    };
    log::debug!("Biggest chunk size: {} bytes", analysis.biggest_chunk);

    let mut mc = ManifestComparison::create(manifest, old_manifest);

    reconcile_resume(manifest, &mut mc, &mut analysis, options, config);

    // selection filters; skipped files become unchanged so no tasks are
    // emitted for them
    let mut deferred_deletions: Vec<FileTask> = Vec::new();
    if let Some(tags) = &options.file_install_tag {
        let skip: BTreeSet<String> = files
            .iter()
            .filter(|fm| !filter::matches_install_tag(fm, tags))
            .map(|fm| fm.filename.clone())
            .collect();
        log::info!("Found {} files to skip based on install tag.", skip.len());
        for filename in &skip {
            deferred_deletions.push(FileTask::new(
                filename.clone(),
                TaskFlags::DELETE_FILE | TaskFlags::SILENT,
            ));
        }
        skip_files(&mut mc, skip);
    }

    if !options.file_exclude_filter.is_empty() {
        let skip: BTreeSet<String> = files
            .iter()
            .filter(|fm| filter::matches_prefix(&fm.filename, &options.file_exclude_filter))
            .map(|fm| fm.filename.clone())
            .collect();
        log::info!("Found {} files to skip based on exclude prefix.", skip.len());
        skip_files(&mut mc, skip);
    }

    if !options.file_exclude_configured.is_empty() {
        let skip: BTreeSet<String> = files
            .iter()
            .filter(|fm| filter::matches_configured(&fm.filename, &options.file_exclude_configured))
            .map(|fm| fm.filename.clone())
            .collect();
        skip_files(&mut mc, skip);
    }

    if !options.file_prefix_filter.is_empty() {
        let skip: BTreeSet<String> = files
            .iter()
            .filter(|fm| !filter::matches_prefix(&fm.filename, &options.file_prefix_filter))
            .map(|fm| fm.filename.clone())
            .collect();
        log::info!(
            "Found {} files to skip based on include prefix(es)",
            skip.len()
        );
        skip_files(&mut mc, skip);
    }

    if !options.file_prefix_filter.is_empty()
        || !options.file_exclude_filter.is_empty()
        || options.file_install_tag.is_some()
    {
        log::info!(
            "Remaining files after filtering: {}",
            mc.added.len() + mc.changed.len()
        );
        analysis.install_size = files
            .iter()
            .filter(|fm| mc.added.contains(&fm.filename))
            .map(|fm| fm.file_size)
            .sum();
    }

    analysis.added = mc.added.len();
    analysis.removed = mc.removed.len();
    analysis.changed = mc.changed.len();
    analysis.unchanged = mc.unchanged.len();

    let mut reorder = options.processing_optimization;
    if reorder && files.len() > REORDER_FILE_LIMIT {
        log::warn!("Manifest contains too many files, processing optimizations will be disabled.");
        reorder = false;
    }

    // process files in case-insensitive name order
    let mut fmlist: Vec<&FileManifest> = files.iter().collect();
    fmlist.sort_by_key(|fm| fm.filename.to_lowercase());

    // reference counts drive the cache simulation during task emission
    let mut references: HashMap<u128, i64> = HashMap::new();
    let mut file_hashes = HashMap::new();
    let mut current_tmp_size: i64 = 0;
    for fm in &fmlist {
        file_hashes.insert(fm.filename.clone(), hex::encode(fm.hash));

        // chunks of unchanged files are not downloaded; their bytes count
        // as reused from disk
        if mc.unchanged.contains(&fm.filename) {
            analysis.reuse_size += fm.file_size;
            continue;
        }

        for cp in &fm.chunk_parts {
            *references.entry(cp.guid.num()).or_insert(0) += 1;
        }

        if mc.added.contains(&fm.filename) {
            current_tmp_size += fm.file_size as i64;
            analysis.disk_space_delta = analysis.disk_space_delta.max(current_tmp_size.max(0) as u64);
        } else if mc.changed.contains(&fm.filename) {
            // a changed file needs temporary space for the full new size,
            // the old file is deleted when the write completes
            current_tmp_size += fm.file_size as i64;
            analysis.disk_space_delta = analysis.disk_space_delta.max(current_tmp_size.max(0) as u64);
            if let Some(old) = old_manifest {
                if let Some(old_file) = old.file_manifest_list.file_by_path(&fm.filename) {
                    current_tmp_size -= old_file.file_size as i64;
                }
            }
        }
    }
    log::debug!(
        "Disk space delta: {:.2} MiB",
        analysis.disk_space_delta as f64 / 1024.0 / 1024.0
    );

    if reorder {
        fmlist = reorder_for_shared_chunks(fmlist, &mc.unchanged);
    }

    // chunk parts recoverable from the previous version of a changed file
    let mut re_usable: HashMap<&str, HashMap<(u128, u32, u32), u64>> = HashMap::new();
    if let Some(old) = old_manifest {
        if options.patch && !mc.changed.is_empty() {
            log::debug!("Analyzing manifests for re-usable chunks...");
            for changed in &mc.changed {
                let (Some(old_file), Some(new_file)) = (
                    old.file_manifest_list.file_by_path(changed),
                    manifest.file_manifest_list.file_by_path(changed),
                ) else {
                    continue;
                };

                let mut existing: HashMap<u128, Vec<(u64, u32, u32)>> = HashMap::new();
                let mut off = 0u64;
                for cp in &old_file.chunk_parts {
                    existing.entry(cp.guid.num()).or_default().push((
                        off,
                        cp.offset,
                        cp.offset + cp.size,
                    ));
                    off += cp.size as u64;
                }

                for cp in &new_file.chunk_parts {
                    let guid = cp.guid.num();
                    for &(file_o, cp_o, cp_end_o) in
                        existing.get(&guid).map(Vec::as_slice).unwrap_or(&[])
                    {
                        // the new part must be wholly contained in the old one
                        if cp_o <= cp.offset && cp.offset + cp.size <= cp_end_o {
                            *references.entry(guid).or_insert(0) -= 1;
                            re_usable
                                .entry(new_file.filename.as_str())
                                .or_default()
                                .insert(
                                    (guid, cp.offset, cp.size),
                                    file_o + (cp.offset - cp_o) as u64,
                                );
                            analysis.reuse_size += cp.size as u64;
                            break;
                        }
                    }
                }
            }
        }
    }

    // chunk parts recoverable from files written earlier in this run
    let mut reusable_written: HashMap<&str, HashMap<(u128, u32, u32), (String, u64)>> =
        HashMap::new();
    if options.read_files {
        log::debug!("Analyzing manifest for re-usable chunks in saved files...");
        let mut written_cps: HashMap<u128, Vec<(String, u64, u32, u32)>> = HashMap::new();
        for cur_file in &fmlist {
            let mut file_cps: HashMap<u128, (String, u64, u32, u32)> = HashMap::new();
            let mut file_offset = 0u64;
            for cp in &cur_file.chunk_parts {
                let guid = cp.guid.num();
                let cp_end = cp.offset + cp.size;
                for (wr_name, wr_foff, wr_cpoff, wr_cpend) in
                    written_cps.get(&guid).map(Vec::as_slice).unwrap_or(&[])
                {
                    if *wr_cpoff <= cp.offset && *wr_cpend >= cp_end {
                        *references.entry(guid).or_insert(0) -= 1;
                        reusable_written
                            .entry(cur_file.filename.as_str())
                            .or_default()
                            .insert(
                                (guid, cp.offset, cp.size),
                                (wr_name.clone(), wr_foff + (cp.offset - wr_cpoff) as u64),
                            );
                        break;
                    }
                }
                file_cps.insert(guid, (cur_file.filename.clone(), file_offset, cp.offset, cp_end));
                file_offset += cp.size as u64;
            }
            for (guid, value) in file_cps {
                written_cps.entry(guid).or_default().push(value);
            }
        }
    }

    // emit tasks while simulating cache residency to find the high-water mark
    log::debug!("Creating filetasks and chunktasks...");
    let biggest_chunk = analysis.biggest_chunk as u64;
    let mut tasks: VecDeque<Task> = VecDeque::new();
    let mut chunks_to_dl: VecDeque<u128> = VecDeque::new();
    let mut chunks_in_dl_list: HashSet<u128> = HashSet::new();
    let mut cached: HashSet<u128> = HashSet::new();
    let mut dl_cache_guids: HashSet<u128> = HashSet::new();
    let mut current_cache_size = 0u64;
    let mut last_cache_size = 0u64;

    for current_file in &fmlist {
        if mc.unchanged.contains(&current_file.filename) {
            continue;
        }
        if current_file.chunk_parts.is_empty() {
            tasks.push_back(Task::File(FileTask::new(
                current_file.filename.clone(),
                TaskFlags::CREATE_EMPTY_FILE,
            )));
            continue;
        }

        let existing = re_usable.get(current_file.filename.as_str());
        let written = reusable_written.get(current_file.filename.as_str());
        let mut chunk_tasks = Vec::with_capacity(current_file.chunk_parts.len());
        let mut reused = 0usize;

        for cp in &current_file.chunk_parts {
            let guid = cp.guid.num();
            let key = (guid, cp.offset, cp.size);
            let mut ct = ChunkTask {
                guid,
                chunk_offset: cp.offset as u64,
                chunk_size: cp.size,
                source: ChunkSource::Download,
                cleanup: false,
            };

            if let Some(&offset) = existing.and_then(|m| m.get(&key)) {
                reused += 1;
                ct.source = ChunkSource::OldFile {
                    path: current_file.filename.clone(),
                    offset,
                };
            } else if let Some((path, offset)) = written.and_then(|m| m.get(&key)) {
                ct.source = ChunkSource::NewFile {
                    path: path.clone(),
                    offset: *offset,
                };
            } else {
                if !chunks_in_dl_list.contains(&guid) {
                    chunks_to_dl.push_back(guid);
                    chunks_in_dl_list.insert(guid);
                }

                // a chunk used more than once stays cached between its
                // consumers; the last consumer releases it
                let refs = references.entry(guid).or_insert(0);
                if *refs > 1 || cached.contains(&guid) {
                    *refs -= 1;
                    if *refs < 1 {
                        current_cache_size -= biggest_chunk;
                        cached.remove(&guid);
                        ct.cleanup = true;
                    } else if !cached.contains(&guid) {
                        dl_cache_guids.insert(guid);
                        cached.insert(guid);
                        current_cache_size += biggest_chunk;
                    }
                } else {
                    ct.cleanup = true;
                }
            }
            chunk_tasks.push(Task::Chunk(ct));
        }

        if reused > 0 {
            log::debug!(
                " + Reusing {} chunks from: {}",
                reused,
                current_file.filename
            );
            // write to a temp file, then atomically replace the old one
            let tmp_name = format!("{}.tmp", current_file.filename);
            tasks.push_back(Task::File(FileTask::new(
                tmp_name.clone(),
                TaskFlags::OPEN_FILE,
            )));
            tasks.extend(chunk_tasks);
            tasks.push_back(Task::File(FileTask::new(
                tmp_name.clone(),
                TaskFlags::CLOSE_FILE,
            )));
            tasks.push_back(Task::File(FileTask::rename(
                current_file.filename.clone(),
                tmp_name,
            )));
        } else {
            tasks.push_back(Task::File(FileTask::new(
                current_file.filename.clone(),
                TaskFlags::OPEN_FILE,
            )));
            tasks.extend(chunk_tasks);
            tasks.push_back(Task::File(FileTask::new(
                current_file.filename.clone(),
                TaskFlags::CLOSE_FILE,
            )));
        }

        if current_file.executable() {
            tasks.push_back(Task::File(FileTask::new(
                current_file.filename.clone(),
                TaskFlags::MAKE_EXECUTABLE,
            )));
        }

        if current_cache_size > last_cache_size {
            log::debug!(
                " * New maximum cache size: {:.2} MiB",
                current_cache_size as f64 / 1024.0 / 1024.0
            );
            last_cache_size = current_cache_size;
        }
    }

    log::debug!(
        "Final cache size requirement: {} MiB.",
        last_cache_size as f64 / 1024.0 / 1024.0
    );
    analysis.min_memory = last_cache_size + CACHE_PADDING;

    if analysis.min_memory > config.max_shared_memory {
        let suggested_mib =
            (analysis.min_memory as f64 / 1024.0 / 1024.0 + 32.0).round() as u64;
        return Err(Error::InsufficientSharedMemory {
            required: analysis.min_memory,
            available: config.max_shared_memory,
            suggested_mib,
        });
    }

    for chunk in &manifest.chunk_data_list.elements {
        if chunks_in_dl_list.contains(&chunk.guid.num()) {
            analysis.dl_size += chunk.file_size.max(0) as u64;
            analysis.uncompressed_dl_size += chunk.window_size as u64;
        }
    }

    for filename in &mc.removed {
        tasks.push_back(Task::File(FileTask::new(
            filename.clone(),
            TaskFlags::DELETE_FILE,
        )));
    }
    tasks.extend(deferred_deletions.into_iter().map(Task::File));

    analysis.num_chunks_cache = dl_cache_guids.len();

    Ok(InstallPlan {
        analysis,
        comparison: mc,
        tasks,
        chunks_to_dl,
        file_hashes,
    })
}

/// Move files into `unchanged` so no tasks are generated for them.
fn skip_files(mc: &mut ManifestComparison, skip: BTreeSet<String>) {
    for filename in skip {
        mc.added.remove(&filename);
        mc.changed.remove(&filename);
        mc.unchanged.insert(filename);
    }
}

/// Fold resume state into the comparison: journaled files that still
/// match are treated as unchanged, and without a journal any new file
/// missing from disk is re-added.
fn reconcile_resume(
    manifest: &Manifest,
    mc: &mut ManifestComparison,
    analysis: &mut AnalysisResult,
    options: &InstallOptions,
    config: &InstallConfig,
) {
    if !options.resume {
        return;
    }

    let journal = config.resume_file.as_ref().map(ResumeJournal::new);
    if let Some(journal) = journal.filter(|j| j.exists()) {
        log::info!("Found previously interrupted download. Download will be resumed if possible.");
        match collect_completed(manifest, &journal, config) {
            Ok(completed) => {
                log::info!("Skipping {} files based on resume data.", completed.len());
                for filename in completed {
                    let was_pending =
                        mc.added.remove(&filename) | mc.changed.remove(&filename);
                    if was_pending {
                        // already on disk, nothing left to install for it
                        if let Some(fm) = manifest.file_manifest_list.file_by_path(&filename) {
                            analysis.install_size =
                                analysis.install_size.saturating_sub(fm.file_size);
                        }
                    }
                    mc.unchanged.insert(filename);
                }
            }
            Err(e) => {
                log::warn!("Reading resume file failed: {}, continuing as normal...", e);
            }
        }
        return;
    }

    // no journal: a quick existence probe lets newly selected files be
    // installed without a full repair pass
    let mut missing = BTreeSet::new();
    for fm in &manifest.file_manifest_list.elements {
        if mc.added.contains(&fm.filename) {
            continue;
        }
        if !config.download_dir.join(&fm.filename).exists() {
            missing.insert(fm.filename.clone());
        }
    }
    log::info!("Found {} missing files.", missing.len());
    for filename in missing {
        mc.changed.remove(&filename);
        mc.unchanged.remove(&filename);
        mc.added.insert(filename);
    }
}

fn collect_completed(
    manifest: &Manifest,
    journal: &ResumeJournal,
    config: &InstallConfig,
) -> Result<BTreeSet<String>> {
    let mut missing = 0usize;
    let mut mismatch = 0usize;
    let mut completed = BTreeSet::new();

    for (file_hash, filename) in journal.load()? {
        let local_path = config.download_dir.join(&filename);
        if !local_path.exists() {
            log::debug!(
                "File does not exist but is in resume file: \"{}\"",
                local_path.display()
            );
            missing += 1;
            continue;
        }

        let fm = manifest
            .file_manifest_list
            .file_by_path(&filename)
            .ok_or_else(|| Error::FileNotFound(filename.clone()))?;
        if file_hash != hex::encode(fm.hash) {
            mismatch += 1;
        } else {
            completed.insert(filename);
        }
    }

    if missing > 0 {
        log::warn!(
            "{} previously completed file(s) are missing, they will be redownloaded.",
            missing
        );
    }
    if mismatch > 0 {
        log::warn!(
            "{} existing file(s) have been changed and will be redownloaded.",
            mismatch
        );
    }
    Ok(completed)
}

/// Greedily pair files that share many chunks so cached chunks are
/// consumed close together, shrinking the cache high-water mark.
fn reorder_for_shared_chunks<'a>(
    fmlist: Vec<&'a FileManifest>,
    unchanged: &BTreeSet<String>,
) -> Vec<&'a FileManifest> {
    log::info!("Processing order optimization is enabled, analysis may take a few seconds longer...");

    let mut remaining: HashMap<&str, HashSet<u128>> = fmlist
        .iter()
        .filter(|fm| !unchanged.contains(&fm.filename))
        .map(|fm| {
            (
                fm.filename.as_str(),
                fm.chunk_parts.iter().map(|cp| cp.guid.num()).collect(),
            )
        })
        .collect();

    let mut reordered = Vec::with_capacity(remaining.len());
    for fm in &fmlist {
        let Some(f_chunks) = remaining.remove(fm.filename.as_str()) else {
            continue;
        };
        reordered.push(*fm);
        if f_chunks.len() < REORDER_PART_THRESHOLD {
            continue;
        }

        // best candidate must beat the overlap floor and every other
        // candidate strictly; candidates are scanned in list order
        let mut best_overlap = 0usize;
        let mut best: Option<&FileManifest> = None;
        for candidate in &fmlist {
            let Some(chunks) = remaining.get(candidate.filename.as_str()) else {
                continue;
            };
            if chunks.len() < REORDER_PART_THRESHOLD {
                continue;
            }
            let overlap = f_chunks.intersection(chunks).count();
            if overlap > REORDER_MIN_OVERLAP && overlap > best_overlap {
                best_overlap = overlap;
                best = Some(*candidate);
            }
        }

        if let Some(paired) = best {
            remaining.remove(paired.filename.as_str());
            reordered.push(paired);
        }
    }
    reordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::files::{ChunkPart, FileManifestList};
    use crate::manifest::guid::Guid;

    fn file_with_guids(name: &str, guids: &[u32]) -> FileManifest {
        let mut file_offset = 0;
        let chunk_parts: Vec<ChunkPart> = guids
            .iter()
            .map(|&g| {
                let cp = ChunkPart {
                    guid: Guid([g, 0, 0, 0]),
                    offset: 0,
                    size: 64,
                    file_offset,
                };
                file_offset += 64;
                cp
            })
            .collect();
        FileManifest {
            filename: name.to_string(),
            file_size: chunk_parts.iter().map(|cp| cp.size as u64).sum(),
            chunk_parts,
            ..Default::default()
        }
    }

    #[test]
    fn test_reorder_pairs_files_sharing_chunks() {
        let a = file_with_guids("a.pak", &[1, 2, 3, 4, 5]);
        let b = file_with_guids("b.pak", &[10, 11, 12, 13, 14]);
        let c = file_with_guids("c.pak", &[1, 2, 3, 4, 5]);
        let manifest = Manifest {
            file_manifest_list: FileManifestList::new(vec![a, b, c]),
            ..Default::default()
        };
        let fmlist: Vec<&FileManifest> = manifest.file_manifest_list.elements.iter().collect();

        let reordered = reorder_for_shared_chunks(fmlist, &BTreeSet::new());
        let names: Vec<&str> = reordered.iter().map(|fm| fm.filename.as_str()).collect();
        // c shares all five chunks with a and is pulled right behind it
        assert_eq!(names, ["a.pak", "c.pak", "b.pak"]);
    }

    #[test]
    fn test_reorder_ignores_small_files() {
        let a = file_with_guids("a.pak", &[1, 2, 3]);
        let b = file_with_guids("b.pak", &[1, 2, 3]);
        let manifest = Manifest {
            file_manifest_list: FileManifestList::new(vec![a, b]),
            ..Default::default()
        };
        let fmlist: Vec<&FileManifest> = manifest.file_manifest_list.elements.iter().collect();

        let reordered = reorder_for_shared_chunks(fmlist, &BTreeSet::new());
        let names: Vec<&str> = reordered.iter().map(|fm| fm.filename.as_str()).collect();
        // below the part threshold nothing is paired
        assert_eq!(names, ["a.pak", "b.pak"]);
    }
}
